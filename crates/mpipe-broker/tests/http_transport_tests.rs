//! HttpTransport against a mock consumer

#[cfg(feature = "http")]
mod http_tests {
    use mpipe_broker::{
        ClientId, ClientInformation, ConsumerTransport, HttpTransport, HttpTransportConfig,
        Message, PipeName, RequestBody, ResponseStatus, TransportError,
    };
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Confirms the whole batch, echoing the request id
    struct ConfirmAll;

    impl Respond for ConfirmAll {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            ResponseTemplate::new(200).set_body_json(json!({
                "requestId": body["requestId"],
                "status": "SUCCESS",
                "successCount": body["messages"].as_array().unwrap().len(),
            }))
        }
    }

    fn client_for(server: &MockServer) -> ClientInformation {
        let address = server.address();
        ClientInformation::new(address.ip().to_string(), address.port(), vec!["orders".into()])
    }

    fn request(client: &ClientInformation, n: usize) -> RequestBody {
        RequestBody {
            request_id: "req-1".to_string(),
            client_id: client.client_id(),
            pipe_name: PipeName::parse("orders").unwrap(),
            messages: (0..n).map(|i| Message::with_id(format!("m-{}", i), "x")).collect(),
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            request_timeout: Duration::from_millis(300),
            ..HttpTransportConfig::default()
        })
    }

    #[tokio::test]
    async fn test_batch_is_posted_and_reply_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message-processing"))
            .respond_with(ConfirmAll)
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport();
        let client = client_for(&server);
        let response = transport
            .message_processing(&client, &request(&client, 3))
            .await
            .unwrap();

        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.success_count, 3);
        assert_eq!(transport.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_error_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message-processing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "requestId": "req-1",
                "status": "ERROR",
                "successCount": 1,
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = transport()
            .message_processing(&client, &request(&client, 2))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.success_count, 1);
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = transport()
            .message_processing(&client, &request(&client, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(!err.is_exclusion_worthy());
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = transport()
            .message_processing(&client, &request(&client, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_slow_consumer_exceeds_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"requestId": "req-1", "status": "SUCCESS", "successCount": 1}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = transport()
            .message_processing(&client, &request(&client, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::DeadlineExceeded(_)));
        assert!(err.is_exclusion_worthy());
    }

    #[tokio::test]
    async fn test_closed_port_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ClientInformation::new("127.0.0.1", port, vec!["orders".into()]);
        let transport = transport();
        let err = transport
            .message_processing(&client, &request(&client, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert!(err.is_exclusion_worthy());

        transport.invalidate(&ClientId::new("127.0.0.1", port));
        assert_eq!(transport.channel_count(), 0);
    }
}
