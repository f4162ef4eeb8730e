mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use lettre::message::Mailbox;
use mailweave::config::MailSettings;
use mailweave::errors::AppError;
use mailweave::transport::{compose, FetchedMessage, LinkState, MailClient, OutgoingMail};
use mailweave::types::FolderCursor;
use support::{fast_policy, raw_mail, valid_settings, FakeOpener, DATE};

fn client(opener: &FakeOpener, folders: &[&str]) -> MailClient {
    MailClient::new(valid_settings(), fast_policy(folders), Arc::new(opener.clone()))
}

fn reply() -> OutgoingMail {
    OutgoingMail {
        to: "carol@example.com".into(),
        subject: "Re: Plan".into(),
        body: "Sounds good".into(),
        in_reply_to: Some("<a@test>".into()),
        references: vec!["<root@test>".into(), "<a@test>".into()],
    }
}

#[tokio::test]
async fn missing_setting_fails_before_any_network_use() {
    let opener = FakeOpener::default();
    let settings = MailSettings {
        smtp_server: None,
        ..valid_settings()
    };
    let mut client = MailClient::new(settings, fast_policy(&["INBOX"]), Arc::new(opener.clone()));

    let err = client.connect().await.expect_err("config error");
    assert!(matches!(err, AppError::Config(ref m) if m.contains("SMTP_SERVER")), "{err}");
    assert_eq!(opener.state.inbound_opens.load(Ordering::SeqCst), 0);
    assert_eq!(client.inbound_state(), LinkState::Disconnected);
}

#[tokio::test]
async fn connect_opens_both_halves() {
    let opener = FakeOpener::default();
    let mut client = client(&opener, &["INBOX"]);
    client.connect().await.expect("connects");

    assert_eq!(client.inbound_state(), LinkState::Connected);
    assert_eq!(client.outbound_state(), LinkState::Connected);
}

#[tokio::test]
async fn refused_login_is_a_connection_error() {
    let opener = FakeOpener::default();
    opener.state.inbound_failures.store(1, Ordering::SeqCst);
    let mut client = client(&opener, &["INBOX"]);

    let err = client.connect().await.expect_err("login refused");
    assert!(matches!(err, AppError::Connection(_)));
    assert_eq!(client.inbound_state(), LinkState::Disconnected);
}

#[tokio::test]
async fn fetch_returns_newest_first_per_folder_in_folder_order() {
    let opener = FakeOpener::default();
    for uid in 1..=3 {
        opener
            .state
            .put("INBOX", uid, raw_mail(&format!("<i{uid}@test>"), "in", &[DATE], "x"));
    }
    opener
        .state
        .put("Archive", 10, raw_mail("<arch@test>", "old", &[DATE], "x"));

    let mut policy = fast_policy(&["INBOX", "Archive"]);
    policy.fetch_limit = 2;
    let mut client = MailClient::new(valid_settings(), policy, Arc::new(opener.clone()));
    client.connect().await.expect("connects");

    let fetched = client.fetch_messages().await.expect("fetches");
    let ids: Vec<(&str, &str)> = fetched
        .iter()
        .map(|m| (m.folder.as_str(), m.native_id.as_str()))
        .collect();
    assert_eq!(ids, vec![("INBOX", "3"), ("INBOX", "2"), ("Archive", "10")]);
}

#[tokio::test]
async fn failing_folder_is_skipped_and_inbound_reconnected() {
    let opener = FakeOpener::default();
    opener.state.break_folder("Gone");
    opener
        .state
        .put("INBOX", 7, raw_mail("<ok@test>", "still here", &[DATE], "x"));

    let mut client = client(&opener, &["Gone", "INBOX"]);
    client.connect().await.expect("connects");

    let fetched = client.fetch_messages().await.expect("fetch succeeds");
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].folder, "INBOX");
    assert_eq!(opener.state.inbound_opens.load(Ordering::SeqCst), 2);
    assert_eq!(client.inbound_state(), LinkState::Connected);
}

#[tokio::test]
async fn fetch_without_inbound_session_is_an_error() {
    let opener = FakeOpener::default();
    let mut client = client(&opener, &["INBOX"]);

    let err = client.fetch_messages().await.expect_err("not connected");
    assert!(matches!(err, AppError::Connection(_)));
}

#[tokio::test]
async fn send_recovers_after_a_transient_failure() {
    let opener = FakeOpener::default();
    opener.state.send_failures.store(1, Ordering::SeqCst);
    let mut client = client(&opener, &["INBOX"]);
    client.connect().await.expect("connects");

    assert!(client.send_message(&reply()).await);
    assert_eq!(opener.state.outbound_opens.load(Ordering::SeqCst), 2);
    let sent = opener.state.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].in_reply_to.as_deref(), Some("<a@test>"));
}

#[tokio::test]
async fn send_gives_up_after_all_attempts() {
    let opener = FakeOpener::default();
    opener.state.send_failures.store(10, Ordering::SeqCst);
    let mut client = client(&opener, &["INBOX"]);
    client.connect().await.expect("connects");

    assert!(!client.send_message(&reply()).await);
    // One session from connect plus a reconnect before each retry.
    assert_eq!(opener.state.outbound_opens.load(Ordering::SeqCst), 3);
    assert!(opener.state.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn send_without_prior_connect_opens_outbound_itself() {
    let opener = FakeOpener::default();
    let mut client = client(&opener, &["INBOX"]);

    assert!(client.send_message(&reply()).await);
    assert_eq!(client.outbound_state(), LinkState::Connected);
}

#[tokio::test]
async fn close_disconnects_both_halves() {
    let opener = FakeOpener::default();
    let mut client = client(&opener, &["INBOX"]);
    client.connect().await.expect("connects");

    client.close().await;
    assert_eq!(client.inbound_state(), LinkState::Disconnected);
    assert_eq!(client.outbound_state(), LinkState::Disconnected);
    assert_eq!(opener.state.logouts.load(Ordering::SeqCst), 1);

    // Closing again is harmless.
    client.close().await;
}

#[test]
fn composed_reply_carries_threading_headers() {
    let from: Mailbox = "Bot <bot@example.com>".parse().unwrap();
    let message = compose(&from, &reply()).expect("composes");
    let text = String::from_utf8(message.formatted()).unwrap();

    assert!(text.contains("In-Reply-To: <a@test>"), "{text}");
    assert!(text.contains("References: <root@test> <a@test>"), "{text}");
    assert!(text.contains("To: carol@example.com"), "{text}");
    assert!(text.contains("Sounds good"), "{text}");
}

#[test]
fn composed_mail_without_parent_has_no_threading_headers() {
    let from: Mailbox = "bot@example.com".parse().unwrap();
    let mail = OutgoingMail {
        to: "carol@example.com".into(),
        subject: "Hello".into(),
        body: "Fresh start".into(),
        ..OutgoingMail::default()
    };
    let text = String::from_utf8(compose(&from, &mail).unwrap().formatted()).unwrap();

    assert!(!text.contains("In-Reply-To"), "{text}");
    assert!(!text.contains("References"), "{text}");
}

fn uids(fetched: &[FetchedMessage]) -> Vec<&str> {
    fetched.iter().map(|m| m.native_id.as_str()).collect()
}

fn put_inbox(opener: &FakeOpener, range: std::ops::RangeInclusive<u32>) {
    for uid in range {
        opener
            .state
            .put("INBOX", uid, raw_mail(&format!("<u{uid}@test>"), "n", &[DATE], "x"));
    }
}

#[tokio::test]
async fn later_fetches_only_list_new_uids() {
    let opener = FakeOpener::default();
    put_inbox(&opener, 1..=3);
    let mut client = client(&opener, &["INBOX"]);
    client.connect().await.expect("connects");

    assert_eq!(uids(&client.fetch_messages().await.unwrap()), vec!["3", "2", "1"]);
    assert!(client.fetch_messages().await.unwrap().is_empty());

    put_inbox(&opener, 4..=4);
    assert_eq!(uids(&client.fetch_messages().await.unwrap()), vec!["4"]);

    let searches = opener.state.searches.lock().unwrap().clone();
    assert_eq!(
        searches,
        vec![
            ("INBOX".to_string(), None),
            ("INBOX".to_string(), Some(3)),
            ("INBOX".to_string(), Some(3)),
        ]
    );
    assert_eq!(
        client.cursors().get("INBOX"),
        Some(&FolderCursor {
            uid_validity: 1,
            highest_uid: 4
        })
    );
}

#[tokio::test]
async fn backlog_above_the_cursor_is_read_oldest_first_across_cycles() {
    let opener = FakeOpener::default();
    put_inbox(&opener, 1..=5);
    let mut policy = fast_policy(&["INBOX"]);
    policy.fetch_limit = 2;
    let mut client = MailClient::new(valid_settings(), policy, Arc::new(opener.clone()));
    client.restore_cursors(HashMap::from([(
        "INBOX".to_string(),
        FolderCursor {
            uid_validity: 1,
            highest_uid: 1,
        },
    )]));
    client.connect().await.expect("connects");

    assert_eq!(uids(&client.fetch_messages().await.unwrap()), vec!["3", "2"]);
    assert_eq!(uids(&client.fetch_messages().await.unwrap()), vec!["5", "4"]);
    assert!(client.fetch_messages().await.unwrap().is_empty());
}

#[tokio::test]
async fn changed_uid_validity_discards_the_cursor() {
    let opener = FakeOpener::default();
    put_inbox(&opener, 1..=2);
    opener.state.set_uid_validity("INBOX", 7);
    let mut client = client(&opener, &["INBOX"]);
    client.restore_cursors(HashMap::from([(
        "INBOX".to_string(),
        FolderCursor {
            uid_validity: 1,
            highest_uid: 10,
        },
    )]));
    client.connect().await.expect("connects");

    assert_eq!(uids(&client.fetch_messages().await.unwrap()), vec!["2", "1"]);
    assert_eq!(
        client.cursors().get("INBOX"),
        Some(&FolderCursor {
            uid_validity: 7,
            highest_uid: 2
        })
    );
}
