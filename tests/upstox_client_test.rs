use mockito::Matcher;
use serde_json::json;

use straddlebot::api::UpstoxClient;
use straddlebot::catalog::{InstrumentCatalog, InstrumentMasterCatalog};
use straddlebot::config::BrokerConfig;
use straddlebot::gateway::OrderGateway;
use straddlebot::{
    GatewayError, Instrument, OptionKind, OrderId, OrderRequest, OrderSide, OrderState,
};

fn client(server: &mockito::ServerGuard) -> UpstoxClient {
    UpstoxClient::new(&BrokerConfig {
        base_url: server.url(),
        access_token: Some("test-token".to_string()),
        requests_per_minute: 600,
        ..Default::default()
    })
    .unwrap()
}

fn ce() -> Instrument {
    Instrument {
        id: "NSE_FO|40001".to_string(),
        symbol: Some("NIFTY 24500 CE 20 OCT 26".to_string()),
        underlying: "NIFTY".to_string(),
        kind: OptionKind::Call,
        strike: 24500.0,
        expiry: chrono::NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
        lot_size: 75,
    }
}

#[tokio::test]
async fn test_ltp_keyed_by_instrument_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v2/market-quote/ltp")
        .match_query(Matcher::UrlEncoded(
            "instrument_key".into(),
            "NSE_INDEX|Nifty 50,NSE_FO|40001".into(),
        ))
        .match_header("authorization", "Bearer test-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "status": "success",
                "data": {
                    "NSE_INDEX:Nifty 50": {"last_price": 24512.3, "instrument_token": "NSE_INDEX|Nifty 50"},
                    "NSE_FO:NIFTY26OCT24500CE": {"last_price": 201.5, "instrument_token": "NSE_FO|40001"}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let prices = client(&server)
        .ltp(&["NSE_INDEX|Nifty 50".to_string(), "NSE_FO|40001".to_string()])
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(prices.get("NSE_INDEX|Nifty 50"), Some(&24512.3));
    assert_eq!(prices.get("NSE_FO|40001"), Some(&201.5));
}

#[tokio::test]
async fn test_option_contracts_catalog() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/v2/option/contract")
        .match_query(Matcher::UrlEncoded(
            "instrument_key".into(),
            "NSE_INDEX|Nifty 50".into(),
        ))
        .with_status(200)
        .with_body(
            json!({
                "status": "success",
                "data": [
                    {"instrument_key": "NSE_FO|40001", "trading_symbol": "NIFTY 24500 CE 20 OCT 26",
                     "strike_price": 24500.0, "instrument_type": "CE", "expiry": "2026-10-20",
                     "lot_size": 75, "underlying_symbol": "NIFTY"},
                    {"instrument_key": "NSE_FO|40002", "trading_symbol": "NIFTY 24500 PE 20 OCT 26",
                     "strike_price": 24500.0, "instrument_type": "PE", "expiry": "2026-10-20",
                     "lot_size": 75, "underlying_symbol": "NIFTY"},
                    {"instrument_key": "NSE_FO|49999", "strike_price": 0.0, "instrument_type": "FUT",
                     "expiry": "2026-10-27", "lot_size": 75, "underlying_symbol": "NIFTY"}
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let catalog = client(&server).catalog("NSE_INDEX|Nifty 50");
    let contracts = catalog.contracts("NIFTY").await.unwrap();

    assert_eq!(contracts.len(), 2);
    assert_eq!(contracts[0].kind, OptionKind::Call);
    assert_eq!(contracts[1].kind, OptionKind::Put);
    assert_eq!(contracts[1].id, "NSE_FO|40002");
    assert_eq!(contracts[0].lot_size, 75);
}

#[tokio::test]
async fn test_place_stop_order_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/order/place")
        .match_body(Matcher::PartialJson(json!({
            "instrument_token": "NSE_FO|40001",
            "quantity": 75,
            "product": "D",
            "validity": "DAY",
            "order_type": "SL",
            "transaction_type": "BUY",
            "trigger_price": 242.0,
            "price": 247.0
        })))
        .with_status(200)
        .with_body(r#"{"status":"success","data":{"order_id":"240101000000123"}}"#)
        .create_async()
        .await;

    let request = OrderRequest::stop(&ce(), OrderSide::Buy, 75, 242.0, 5.0);
    let id = client(&server).place(&request).await.unwrap();

    mock.assert_async().await;
    assert_eq!(id, OrderId::from("240101000000123"));
}

#[tokio::test]
async fn test_rejected_order_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/order/place")
        .with_status(400)
        .with_body(r#"{"status":"error","errors":[{"message":"Insufficient funds"}]}"#)
        .expect(1)
        .create_async()
        .await;

    let request = OrderRequest::market(&ce(), OrderSide::Sell, 75);
    let err = client(&server).place(&request).await.unwrap_err();

    mock.assert_async().await;
    assert!(matches!(err, GatewayError::Rejected(msg) if msg.contains("Insufficient funds")));
}

#[tokio::test]
async fn test_server_error_is_transport() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("DELETE", "/v2/order/cancel")
        .match_query(Matcher::UrlEncoded("order_id".into(), "42".into()))
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server).cancel(&OrderId::from("42")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));
}

#[tokio::test]
async fn test_cancel_and_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("DELETE", "/v2/order/cancel")
        .match_query(Matcher::UrlEncoded("order_id".into(), "42".into()))
        .with_status(200)
        .with_body(r#"{"status":"success","data":{"order_id":"42"}}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/v2/order/details")
        .match_query(Matcher::UrlEncoded("order_id".into(), "43".into()))
        .with_status(200)
        .with_body(r#"{"status":"success","data":{"status":"complete","average_price":243.5}}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/v2/order/details")
        .match_query(Matcher::UrlEncoded("order_id".into(), "44".into()))
        .with_status(200)
        .with_body(r#"{"status":"success","data":{"status":"trigger pending","average_price":0.0}}"#)
        .create_async()
        .await;

    let client = client(&server);
    client.cancel(&OrderId::from("42")).await.unwrap();

    let filled = client.status(&OrderId::from("43")).await.unwrap();
    assert_eq!(filled.state, OrderState::Filled);
    assert_eq!(filled.fill_price(), Some(243.5));

    let resting = client.status(&OrderId::from("44")).await.unwrap();
    assert_eq!(resting.state, OrderState::Pending);
    assert_eq!(resting.fill_price(), None);
}

#[tokio::test]
async fn test_instrument_master_contract_uses_gateway_keys() {
    let master = r#"[
        {"token":"43215","symbol":"NIFTY20OCT2624500CE","name":"NIFTY","expiry":"20OCT2026",
         "strike":"2450000.000000","lotsize":"75","instrumenttype":"OPTIDX","exch_seg":"NFO"}
    ]"#;
    let catalog = InstrumentMasterCatalog::from_json(master)
        .unwrap()
        .with_segment(&BrokerConfig::default().fo_segment);
    let ce = catalog.contracts("NIFTY").await.unwrap().remove(0);
    assert_eq!(ce.id, "NSE_FO|43215");

    let mut server = mockito::Server::new_async().await;
    let quote = server
        .mock("GET", "/v2/market-quote/ltp")
        .match_query(Matcher::UrlEncoded(
            "instrument_key".into(),
            "NSE_FO|43215".into(),
        ))
        .with_status(200)
        .with_body(
            json!({
                "status": "success",
                "data": {
                    "NSE_FO:NIFTY26OCT24500CE": {"last_price": 188.0, "instrument_token": "NSE_FO|43215"}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    let order = server
        .mock("POST", "/v2/order/place")
        .match_body(Matcher::PartialJson(json!({
            "instrument_token": "NSE_FO|43215",
            "order_type": "MARKET",
            "transaction_type": "SELL"
        })))
        .with_status(200)
        .with_body(r#"{"status":"success","data":{"order_id":"77"}}"#)
        .create_async()
        .await;

    let client = client(&server);
    let prices = client.ltp(&[ce.id.clone()]).await.unwrap();
    assert_eq!(prices.get(&ce.id), Some(&188.0));

    let id = client
        .place(&OrderRequest::market(&ce, OrderSide::Sell, 75))
        .await
        .unwrap();
    assert_eq!(id, OrderId::from("77"));

    quote.assert_async().await;
    order.assert_async().await;
}
