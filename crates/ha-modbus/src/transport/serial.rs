//! Serial line links (RS-232/RS-485)

use super::framing::{Framing, StreamTransport};
use crate::config::{Parity, SerialConfig, SerialMethod};
use std::io;
use std::time::Duration;
use tokio_serial::{DataBits, SerialStream, StopBits};
use tracing::debug;

/// Above this rate the RTU silent interval is fixed at 1.75 ms
const FIXED_GAP_BAUD: u32 = 19_200;

/// Open the port and wrap it in the configured framing
pub fn open(config: &SerialConfig) -> io::Result<StreamTransport<SerialStream>> {
    let builder = tokio_serial::new(&config.port, config.baudrate)
        .data_bits(data_bits(config.bytesize)?)
        .parity(match config.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        })
        .stop_bits(if config.stopbits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        });

    let stream = SerialStream::open(&builder).map_err(io::Error::from)?;
    debug!(port = %config.port, baudrate = config.baudrate, "Opened serial port");

    let transport = match config.method {
        SerialMethod::Rtu => StreamTransport::new(stream, Framing::Rtu, config.port.clone())
            .with_turnaround(rtu_silent_interval(config)),
        SerialMethod::Ascii => StreamTransport::new(stream, Framing::Ascii, config.port.clone()),
    };
    Ok(transport)
}

fn data_bits(bytesize: u8) -> io::Result<DataBits> {
    match bytesize {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported bytesize {}", other),
        )),
    }
}

/// 3.5 character times between RTU frames
fn rtu_silent_interval(config: &SerialConfig) -> Duration {
    if config.baudrate > FIXED_GAP_BAUD {
        return Duration::from_micros(1750);
    }
    let parity_bits = u64::from(config.parity != Parity::None);
    let char_bits = 1 + u64::from(config.bytesize) + parity_bits + u64::from(config.stopbits);
    Duration::from_micros(char_bits * 3_500_000 / u64::from(config.baudrate.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(baudrate: u32, parity: Parity) -> SerialConfig {
        SerialConfig {
            port: "/dev/null".into(),
            baudrate,
            bytesize: 8,
            parity,
            stopbits: 1,
            method: SerialMethod::Rtu,
        }
    }

    #[test]
    fn test_silent_interval() {
        // 11 bit characters at 9600 baud: 3.5 * 11 / 9600 s
        assert_eq!(
            rtu_silent_interval(&line(9600, Parity::Even)),
            Duration::from_micros(4010)
        );
        assert_eq!(
            rtu_silent_interval(&line(115_200, Parity::None)),
            Duration::from_micros(1750)
        );
    }

    #[test]
    fn test_data_bits() {
        assert!(matches!(data_bits(7), Ok(DataBits::Seven)));
        assert!(data_bits(9).is_err());
    }
}
