mod common;

use std::sync::Arc;

use tether_core::errors::ConnectionError;
use tether_core::ids::SessionId;
use tether_core::mock::{MockConnection, MockTransport, MOCK_PAIRING_CODE};
use tether_core::transport::{Lifecycle, Socket};
use tether_session::{pairing_handler, ConnectionState, PairingMethod};
use tokio::sync::{mpsc, Notify};

use common::{eventually, fast_options, settle, Harness, RecordingPrompt};

const ID: SessionId = SessionId::new(3);

fn offering(payloads: &[&str]) -> MockTransport {
    MockTransport::with_script(
        payloads
            .iter()
            .map(|p| Lifecycle::PairingOffer((*p).to_string()))
            .collect(),
    )
}

#[tokio::test(start_paused = true)]
async fn background_session_gives_up_on_pairing() {
    let h = Harness::with_prompt(offering(&["ref"]), RecordingPrompt::new(PairingMethod::Qr));

    let result = h.hub.connect(ID, fast_options().background(2)).await;

    assert!(matches!(result, Err(ConnectionError::PairingRequired)));
    assert_eq!(h.prompt.choices(), 0);
    assert!(!h.transport.connection(0).unwrap().socket.is_alive());
    assert!(h.hub.client(ID).is_none());
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    assert_eq!(h.transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn handler_gets_payload_and_code_requester() {
    let h = Harness::with_prompt(offering(&["ref-1"]), RecordingPrompt::new(PairingMethod::Qr));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = pairing_handler(move |request| {
        let tx = tx.clone();
        async move {
            let code = request.requester.request("15550001111").await;
            let _ = tx.send((request.session_id, request.payload, code));
        }
    });

    let opener = async {
        let (session_id, payload, code) = rx.recv().await.unwrap();
        assert_eq!(session_id, ID);
        assert_eq!(payload, "ref-1");
        assert_eq!(code.unwrap(), MOCK_PAIRING_CODE);
        h.transport.last_connection().unwrap().open().await;
    };
    let (result, ()) = tokio::join!(
        h.hub.connect(ID, fast_options().pairing_handler(handler)),
        opener
    );

    assert!(result.is_ok());
    assert_eq!(h.prompt.choices(), 0);
    assert!(h.prompt.shown().is_empty());
}

#[tokio::test(start_paused = true)]
async fn phone_code_requested_once_per_socket() {
    let h = Harness::with_prompt(
        offering(&["a", "b"]),
        RecordingPrompt::new(PairingMethod::Phone),
    );
    let opener = async {
        eventually(|| !h.prompt.shown().is_empty()).await;
        settle().await;
        h.transport.last_connection().unwrap().open().await;
    };
    let (result, ()) = tokio::join!(h.hub.connect(ID, fast_options()), opener);

    assert!(result.is_ok());
    assert_eq!(h.prompt.shown(), vec![format!("code:{MOCK_PAIRING_CODE}")]);
    assert_eq!(h.prompt.choices(), 1);
    let socket = h.transport.connection(0).unwrap().socket;
    assert_eq!(socket.pairing_requests(), vec!["15550001111".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn qr_method_is_chosen_once_per_session() {
    let h = Harness::with_prompt(offering(&["qr-1"]), RecordingPrompt::new(PairingMethod::Qr));
    let driver = async {
        eventually(|| h.prompt.shown().len() == 1).await;
        h.transport.connection(0).unwrap().close(428).await;
        eventually(|| h.prompt.shown().len() == 2).await;
        h.transport.connection(1).unwrap().open().await;
    };
    let (result, ()) = tokio::join!(h.hub.connect(ID, fast_options()), driver);

    let connected = result.unwrap();
    assert_eq!(connected.client.state(), ConnectionState::Connected);
    assert_eq!(h.prompt.shown(), vec!["qr:qr-1", "qr:qr-1"]);
    assert_eq!(h.prompt.choices(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_session_ignores_offer_without_handler() {
    let h = Harness::with_prompt(offering(&["ref"]), RecordingPrompt::new(PairingMethod::Qr));
    let opener = async {
        h.transport.wait_for_attempts(1).await;
        settle().await;
        h.transport.last_connection().unwrap().open().await;
    };
    let (result, ()) = tokio::join!(h.hub.connect(ID, fast_options().silent(true)), opener);

    assert!(result.is_ok());
    assert_eq!(h.prompt.choices(), 0);
    assert!(h.prompt.shown().is_empty());
}

#[tokio::test(start_paused = true)]
async fn refreshed_qr_offer_is_shown_on_same_socket() {
    let h = Harness::with_prompt(MockTransport::new(), RecordingPrompt::new(PairingMethod::Qr));
    let driver = async {
        h.transport.wait_for_attempts(1).await;
        let conn = h.transport.last_connection().unwrap();
        conn.offer_pairing("qr-a").await;
        eventually(|| h.prompt.shown().len() == 1).await;
        conn.offer_pairing("qr-b").await;
        eventually(|| h.prompt.shown().len() == 2).await;
        conn.open().await;
    };
    let (result, ()) = tokio::join!(h.hub.connect(ID, fast_options()), driver);

    assert!(result.is_ok());
    assert_eq!(h.prompt.shown(), vec!["qr:qr-a", "qr:qr-b"]);
    assert_eq!(h.prompt.choices(), 1);
    assert_eq!(h.transport.attempts(), 1);
}

fn connection_for(h: &Harness, id: SessionId) -> MockConnection {
    (0..h.transport.connect_count())
        .filter_map(|i| h.transport.connection(i))
        .find(|c| c.auth.session_id == id)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn one_pairing_prompt_at_a_time_across_sessions() {
    const OTHER: SessionId = SessionId::new(4);
    let gate = Arc::new(Notify::new());
    let h = Harness::with_prompt(
        MockTransport::new(),
        RecordingPrompt::gated(PairingMethod::Qr, Arc::clone(&gate)),
    );
    let driver = async {
        h.transport.wait_for_attempts(2).await;
        let first = connection_for(&h, ID);
        let second = connection_for(&h, OTHER);

        first.offer_pairing("qr-3").await;
        eventually(|| h.prompt.choices() == 1).await;
        second.offer_pairing("qr-4").await;
        settle().await;
        assert_eq!(h.prompt.choices(), 1);
        assert!(h.prompt.shown().is_empty());

        gate.notify_one();
        eventually(|| h.prompt.shown().len() == 1).await;
        assert_eq!(h.prompt.shown(), vec!["qr:qr-3"]);

        // The prompt is free again once the first session is done with it.
        gate.notify_one();
        second.offer_pairing("qr-4b").await;
        eventually(|| h.prompt.shown().len() == 2).await;
        assert_eq!(h.prompt.choices(), 2);

        first.open().await;
        second.open().await;
    };
    let (first, second, ()) = tokio::join!(
        h.hub.connect(ID, fast_options()),
        h.hub.connect(OTHER, fast_options()),
        driver
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(h.prompt.shown(), vec!["qr:qr-3", "qr:qr-4b"]);
    assert_eq!(h.transport.attempts(), 2);
}
