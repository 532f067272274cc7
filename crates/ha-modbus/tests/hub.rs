mod common;

use common::{stub_config, StubConnector, StubDevice};
use futures::future::join_all;
use ha_modbus::{
    ExceptionCode, Hub, HubState, ModbusError, ModbusResult, ProtocolError, Request,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn ready_hub(device: &Arc<StubDevice>) -> Arc<Hub> {
    let hub = Arc::new(Hub::new(stub_config("test"), StubConnector::new(Arc::clone(device))));
    assert_eq!(hub.establish().await, HubState::Ready);
    hub
}

/// Runs every operation kind once, collecting the errors
async fn every_operation(hub: &Hub) -> Vec<ModbusResult<()>> {
    vec![
        hub.read_coils(Some(1), 0, 1).await.map(drop),
        hub.read_discrete_inputs(Some(1), 0, 1).await.map(drop),
        hub.read_input_registers(Some(1), 0, 1).await.map(drop),
        hub.read_holding_registers(Some(1), 0, 1).await.map(drop),
        hub.write_coil(Some(1), 0, true).await,
        hub.write_register(Some(1), 0, 1).await,
        hub.write_registers(Some(1), 0, &[1, 2]).await,
    ]
}

#[tokio::test]
async fn test_operations_without_transport_fail_fast() {
    let device = StubDevice::new();
    let hub = Hub::new(stub_config("test"), StubConnector::new(Arc::clone(&device)));
    assert_eq!(hub.state(), HubState::Uninitialized);

    let results = tokio::time::timeout(Duration::from_millis(100), every_operation(&hub))
        .await
        .expect("operations without a transport must not block");

    assert_eq!(results.len(), 7);
    for result in results {
        assert_eq!(result, Err(ModbusError::NoTransport));
    }
    assert!(device.exchanges().is_empty());
}

#[tokio::test]
async fn test_failed_establish_can_be_retried() {
    let device = StubDevice::new();
    let connector = StubConnector::refusing(Arc::clone(&device));
    let hub = Hub::new(stub_config("test"), connector.clone());

    assert_eq!(hub.establish().await, HubState::Uninitialized);
    assert_eq!(
        hub.read_holding_registers(None, 0, 1).await,
        Err(ModbusError::NoTransport)
    );

    connector.set_refuse(false);
    assert_eq!(hub.establish().await, HubState::Ready);
    assert_eq!(hub.read_holding_registers(None, 0, 1).await, Ok(vec![0]));
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_establish_is_idempotent() {
    let device = StubDevice::new();
    let connector = StubConnector::new(Arc::clone(&device));
    let hub = Hub::new(stub_config("test"), connector.clone());

    let states = join_all((0..4).map(|_| hub.establish())).await;
    assert!(states.contains(&HubState::Ready));
    assert_eq!(hub.establish().await, HubState::Ready);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_settle_delay_applied_once() {
    let device = StubDevice::new();
    let config = stub_config("test").with_delay(Duration::from_secs(2));
    let hub = Arc::new(Hub::new(config, StubConnector::new(Arc::clone(&device))));
    hub.establish().await;

    let start = Instant::now();
    let first = join_all((0..3).map(|i| {
        let hub = Arc::clone(&hub);
        async move { hub.read_input_registers(None, i, 1).await }
    }))
    .await;
    assert!(first.iter().all(|r| r.is_ok()));
    // concurrent first callers share one delay
    let settled = start.elapsed();
    assert!(settled >= Duration::from_secs(2));
    assert!(settled < Duration::from_secs(4));

    let again = Instant::now();
    hub.read_input_registers(None, 0, 1).await.unwrap();
    hub.write_register(None, 0, 7).await.unwrap();
    assert!(again.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_exchanges_never_overlap() {
    let device = StubDevice::new();
    device.set_latency(Duration::from_millis(20));
    let hub = ready_hub(&device).await;

    let tasks: Vec<_> = (0..16u16)
        .map(|i| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                if i % 2 == 0 {
                    hub.write_register(Some(1), i, i).await
                } else {
                    hub.read_holding_registers(Some(1), i, 2).await.map(drop)
                }
            })
        })
        .collect();

    for result in join_all(tasks).await {
        assert_eq!(result.unwrap(), Ok(()));
    }
    assert_eq!(device.exchanges().len(), 16);
    assert_eq!(device.overlaps(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_releases_gate_and_keeps_transport() {
    let device = StubDevice::new();
    let connector = StubConnector::new(Arc::clone(&device));
    let hub = Hub::new(stub_config("test"), connector.clone());
    hub.establish().await;

    device.set_hang(true);
    assert_eq!(
        hub.read_coils(Some(1), 0, 8).await,
        Err(ModbusError::Timeout(Duration::from_secs(1)))
    );

    assert_eq!(device.abandoned(), 1);

    device.set_hang(false);
    assert_eq!(hub.write_coil(Some(1), 3, true).await, Ok(()));
    assert_eq!(hub.read_coils(Some(1), 3, 1).await, Ok(vec![true]));
    assert_eq!(hub.state(), HubState::Ready);
    assert_eq!(connector.connects(), 1);
    assert!(!device.is_closed());
}

#[tokio::test]
async fn test_wrong_response_kind_is_malformed() {
    let device = StubDevice::new();
    let hub = ready_hub(&device).await;

    device.set_mismatch(true);
    let err = hub.read_holding_registers(Some(1), 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Protocol(ProtocolError::Malformed(_))));
    assert_eq!(device.abandoned(), 0);

    device.set_mismatch(false);
    assert_eq!(hub.read_holding_registers(Some(1), 0, 1).await, Ok(vec![0]));
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let device = StubDevice::new();
    let hub = ready_hub(&device).await;

    hub.write_register(Some(1), 10, 42).await.unwrap();
    assert_eq!(hub.read_holding_registers(Some(1), 10, 1).await, Ok(vec![42]));
}

#[tokio::test]
async fn test_write_registers_is_one_exchange() {
    let device = StubDevice::new();
    let hub = ready_hub(&device).await;

    hub.write_registers(Some(1), 0, &[1, 2, 3]).await.unwrap();

    assert_eq!(
        device.requests(),
        vec![Request::WriteMultipleRegisters(0, vec![1, 2, 3])]
    );
    assert_eq!(device.register(2), 3);
}

#[tokio::test]
async fn test_unit_passed_only_when_given() {
    let device = StubDevice::new();
    let hub = ready_hub(&device).await;

    hub.read_discrete_inputs(None, 0, 2).await.unwrap();
    hub.read_discrete_inputs(Some(9), 0, 2).await.unwrap();

    let units: Vec<_> = device.exchanges().into_iter().map(|(u, _)| u).collect();
    assert_eq!(units, vec![None, Some(9)]);
}

#[tokio::test]
async fn test_device_exception_is_protocol_error() {
    let device = StubDevice::new();
    device.set_limit(100);
    let hub = ready_hub(&device).await;

    let err = hub.read_holding_registers(Some(1), 200, 1).await.unwrap_err();
    assert_eq!(
        err,
        ModbusError::Protocol(ProtocolError::Exception(ExceptionCode::IllegalDataAddress))
    );
    assert_eq!(err.to_string(), "protocol error: device exception 0x02 (illegal data address)");
    assert!(!err.is_transient());

    // the hub stays usable
    assert_eq!(hub.read_input_registers(Some(1), 5, 2).await, Ok(vec![5, 6]));
}

#[tokio::test]
async fn test_contract_violations_never_reach_the_link() {
    let device = StubDevice::new();
    let hub = ready_hub(&device).await;

    let too_many: Vec<u16> = vec![0; 124];
    let results = vec![
        hub.read_coils(None, 0, 0).await.map(drop),
        hub.read_coils(None, 0, 2001).await.map(drop),
        hub.read_holding_registers(None, 0, 126).await.map(drop),
        hub.read_input_registers(None, u16::MAX, 2).await.map(drop),
        hub.write_registers(None, 0, &[]).await,
        hub.write_registers(None, 0, &too_many).await,
    ];

    for result in results {
        assert!(
            matches!(result, Err(ModbusError::InvalidRequest(_))),
            "{:?}",
            result
        );
    }
    assert!(device.exchanges().is_empty());
}

#[tokio::test]
async fn test_teardown_closes_and_blocks_operations() {
    let device = StubDevice::new();
    let hub = ready_hub(&device).await;
    hub.read_coils(None, 0, 1).await.unwrap();

    hub.teardown().await;
    assert_eq!(hub.state(), HubState::Closed);
    assert!(device.is_closed());

    for result in every_operation(&hub).await {
        assert_eq!(result, Err(ModbusError::NoTransport));
    }
    assert_eq!(device.exchanges().len(), 1);

    // closed is terminal
    assert_eq!(hub.establish().await, HubState::Closed);
    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_waits_for_in_flight_exchange() {
    let device = StubDevice::new();
    device.set_latency(Duration::from_millis(500));
    let hub = ready_hub(&device).await;

    let reader = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { hub.read_holding_registers(None, 0, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    hub.teardown().await;
    assert_eq!(reader.await.unwrap(), Ok(vec![0]));
    assert!(device.is_closed());
    assert_eq!(device.overlaps(), 0);
}
