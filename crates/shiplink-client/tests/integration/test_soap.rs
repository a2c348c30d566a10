//! SOAP calls sharing one session token

use std::{sync::Arc, time::Duration};

use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shiplink_client::{
    soap::{SoapClient, SoapLoginAcquirer},
    token::SharedTokenManager,
    ClientError,
};

use crate::common::{fast_policy, login_response};

fn soap_stack(server: &MockServer) -> (Arc<SharedTokenManager>, SoapClient) {
    let endpoint = format!("{}/ws", server.uri());
    let acquirer = SoapLoginAcquirer::new(&endpoint, "robot", "secret", Duration::from_secs(1800));
    let tokens = Arc::new(SharedTokenManager::new(
        Arc::new(acquirer),
        Duration::from_secs(60),
    ));
    let client = SoapClient::new(endpoint, Arc::clone(&tokens)).with_retry_policy(fast_policy());
    (tokens, client)
}

async fn mount_login(server: &MockServer, token: &str, delay: Duration, times: u64) {
    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Login"))
        .and(body_string_contains("<Username>robot</Username>"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(login_response(token))
                .set_delay(delay),
        )
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_call_logs_in_and_sends_token_header() {
    let server = MockServer::start().await;
    mount_login(&server, "tok-1", Duration::ZERO, 1).await;

    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "GetLabel"))
        .and(body_string_contains("<Token>tok-1</Token>"))
        .and(body_string_contains("<GetLabel><Id>SHP-1</Id></GetLabel>"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<ok/>"))
        .expect(2)
        .mount(&server)
        .await;

    let (tokens, client) = soap_stack(&server);

    let body = "<GetLabel><Id>SHP-1</Id></GetLabel>";
    assert_eq!(client.call("GetLabel", body).await.unwrap(), "<ok/>");
    assert_eq!(client.call("GetLabel", body).await.unwrap(), "<ok/>");
    assert_eq!(tokens.acquisitions(), 1);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_login() {
    let server = MockServer::start().await;
    mount_login(&server, "tok-1", Duration::from_millis(200), 1).await;

    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Ping"))
        .and(body_string_contains("<Token>tok-1</Token>"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<pong/>"))
        .expect(10)
        .mount(&server)
        .await;

    let (tokens, client) = soap_stack(&server);
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move { client.call("Ping", "<Ping/>").await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "<pong/>");
    }

    assert_eq!(tokens.acquisitions(), 1);
    assert_eq!(tokens.current().unwrap().token(), "tok-1");
}

#[tokio::test]
async fn test_rejected_token_is_invalidated_and_reacquired() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(login_response("tok-1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_login(&server, "tok-2", Duration::ZERO, 1).await;

    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Ping"))
        .and(body_string_contains("<Token>tok-1</Token>"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Ping"))
        .and(body_string_contains("<Token>tok-2</Token>"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<pong/>"))
        .mount(&server)
        .await;

    let (tokens, client) = soap_stack(&server);

    let err = client.call("Ping", "<Ping/>").await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized(_)));
    assert!(tokens.current().is_none());

    assert_eq!(client.call("Ping", "<Ping/>").await.unwrap(), "<pong/>");
    assert_eq!(tokens.acquisitions(), 2);
}

#[tokio::test]
async fn test_login_fault_is_reported_and_nothing_stored() {
    let server = MockServer::start().await;

    let fault = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><soap:Fault>
    <faultcode>soap:Client</faultcode>
    <faultstring>Invalid credentials</faultstring>
  </soap:Fault></soap:Body>
</soap:Envelope>"#;
    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Login"))
        .respond_with(ResponseTemplate::new(400).set_body_string(fault))
        .expect(2)
        .mount(&server)
        .await;

    let (tokens, client) = soap_stack(&server);

    for _ in 0..2 {
        match client.call("Ping", "<Ping/>").await {
            Err(ClientError::TokenAcquisition(message)) => {
                assert_eq!(message, "Invalid credentials");
            }
            other => panic!("expected TokenAcquisition, got {other:?}"),
        }
    }
    assert!(tokens.current().is_none());
    assert_eq!(tokens.acquisitions(), 2);
}

#[tokio::test]
async fn test_out_of_range_expiry_is_rejected_without_panicking() {
    let server = MockServer::start().await;

    let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <LoginResponse xmlns="urn:shiplink:auth">
      <Token>tok-1</Token>
      <ExpiresIn>9223372036854775807</ExpiresIn>
    </LoginResponse>
  </soap:Body>
</soap:Envelope>"#;
    Mock::given(method("POST"))
        .and(path("/ws"))
        .and(header("SOAPAction", "Login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let (tokens, client) = soap_stack(&server);
    let joined = tokio::spawn(async move { client.call("Ping", "<Ping/>").await }).await;

    let result = joined.expect("login task must not panic");
    assert!(matches!(result, Err(ClientError::InvalidResponse(_))));
    assert!(tokens.current().is_none());
}
