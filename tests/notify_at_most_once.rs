// tests/notify_at_most_once.rs
//
// Dispatcher guarantees: one notification per (release, customer), ever.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use merch_radar::error::NotifyError;
use merch_radar::model::{CustomerInterest, Release, ReleaseStatus};
use merch_radar::notify::{NotificationDispatcher, Notifier, ReleaseNotice, WebhookNotifier};
use merch_radar::store::{MemoryStore, Store};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recording {
    sent: Mutex<Vec<(String, u8)>>,
    fail_for: Option<String>,
}

impl Recording {
    fn failing_for(customer: &str) -> Self {
        Self {
            fail_for: Some(customer.to_string()),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, u8)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Recording {
    async fn send(&self, customer_id: &str, score: u8, _notice: &ReleaseNotice) -> Result<(), NotifyError> {
        if self.fail_for.as_deref() == Some(customer_id) {
            return Err(NotifyError::Send {
                customer_id: customer_id.to_string(),
                message: "mailbox full".into(),
            });
        }
        self.sent.lock().unwrap().push((customer_id.to_string(), score));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

fn release(id: &str, status: ReleaseStatus) -> Release {
    Release {
        id: id.into(),
        title: "Figment Popcorn Bucket".into(),
        canonical_name: format!("figmentpopcornbucket{id}"),
        description: "Purple dragon returns for the festival".into(),
        image_url: String::new(),
        original_image_url: None,
        park: Some("epcot".into()),
        category: Some("popcorn buckets".into()),
        price_estimate: Some(25.0),
        limited_edition: true,
        status,
        merged_into_id: None,
        source_url: "https://blog.example/figment".into(),
        created_at: Utc::now(),
    }
}

fn interest(id: &str, customer: &str, park: Option<&str>, keywords: &[&str]) -> CustomerInterest {
    CustomerInterest {
        id: id.into(),
        customer_id: customer.into(),
        category: None,
        park: park.map(str::to_string),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        notify: true,
    }
}

async fn seeded() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_release(release("r1", ReleaseStatus::Approved)).await.unwrap();
    for i in [
        interest("i1", "alice", Some("EPCOT"), &["figment"]),
        interest("i2", "bob", None, &[]),
        interest("i3", "carol", Some("Magic Kingdom"), &[]),
    ] {
        store.upsert_interest(i).await.unwrap();
    }
    store
}

#[tokio::test]
async fn repeated_dispatch_sends_once() {
    let store = seeded().await;
    let notifier = Arc::new(Recording::default());
    let d = NotificationDispatcher::new(store.clone(), notifier.clone());
    let cancel = CancellationToken::new();

    let first = d.dispatch("r1", &cancel).await.unwrap();
    assert_eq!(first.matched, 2);
    assert_eq!(first.sent, 2);
    // Best score first.
    assert_eq!(
        notifier.sent(),
        vec![("alice".to_string(), 2), ("bob".to_string(), 0)]
    );

    let second = d.dispatch("r1", &cancel).await.unwrap();
    assert_eq!(second.matched, 0);
    assert_eq!(second.sent, 0);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn failed_send_is_not_retried() {
    let store = seeded().await;
    let d = NotificationDispatcher::new(store.clone(), Arc::new(Recording::failing_for("alice")));
    let cancel = CancellationToken::new();

    let report = d.dispatch("r1", &cancel).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert!(store.has_notification("r1", "alice").await.unwrap());

    let notifier = Arc::new(Recording::default());
    let d = NotificationDispatcher::new(store, notifier.clone());
    assert_eq!(d.dispatch("r1", &cancel).await.unwrap().matched, 0);
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn pending_and_merged_releases_are_refused() {
    let store = seeded().await;
    store.insert_release(release("r2", ReleaseStatus::Pending)).await.unwrap();
    let mut merged = release("r3", ReleaseStatus::Approved);
    merged.merged_into_id = Some("r1".into());
    store.insert_release(merged).await.unwrap();

    let d = NotificationDispatcher::new(store, Arc::new(Recording::default()));
    let cancel = CancellationToken::new();
    assert!(matches!(
        d.dispatch("r2", &cancel).await,
        Err(NotifyError::NotApproved(_))
    ));
    assert!(matches!(
        d.dispatch("r3", &cancel).await,
        Err(NotifyError::Merged { .. })
    ));
    assert!(matches!(
        d.dispatch("nope", &cancel).await,
        Err(NotifyError::Store(_))
    ));
}

#[tokio::test]
async fn concurrent_dispatches_never_double_send() {
    let store = seeded().await;
    let notifier = Arc::new(Recording::default());
    let a = NotificationDispatcher::new(store.clone(), notifier.clone());
    let b = NotificationDispatcher::new(store.clone(), notifier.clone());
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(a.dispatch("r1", &cancel), b.dispatch("r1", &cancel));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.sent + rb.sent, 2);
    let mut who: Vec<String> = notifier.sent().into_iter().map(|(c, _)| c).collect();
    who.sort();
    assert_eq!(who, vec!["alice", "bob"]);
}

#[tokio::test]
async fn cancelled_dispatch_leaves_customers_for_later() {
    let store = seeded().await;
    let notifier = Arc::new(Recording::default());
    let d = NotificationDispatcher::new(store, notifier.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = d.dispatch("r1", &cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.sent, 0);

    let report = d.dispatch("r1", &CancellationToken::new()).await.unwrap();
    assert_eq!(report.sent, 2);
}

#[tokio::test]
async fn webhook_retries_then_delivers_payload() {
    #[derive(Default)]
    struct Hook {
        calls: Mutex<Vec<Value>>,
    }
    let hook = Arc::new(Hook::default());
    let app = Router::new()
        .route(
            "/hook",
            post(|State(h): State<Arc<Hook>>, Json(body): Json<Value>| async move {
                let mut calls = h.calls.lock().unwrap();
                calls.push(body);
                if calls.len() == 1 {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::NO_CONTENT
                }
            }),
        )
        .with_state(hook.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let notifier = WebhookNotifier::new(format!("http://{addr}/hook"))
        .with_retries(3)
        .with_backoff_ms(5);
    let notice = ReleaseNotice::from(&release("r1", ReleaseStatus::Approved));
    notifier.send("alice", 2, &notice).await.unwrap();

    let calls = hook.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1]["event"], "release.approved");
    assert_eq!(calls[1]["customer_id"], "alice");
    assert_eq!(calls[1]["score"], 2);
    assert_eq!(calls[1]["release"]["release_id"], "r1");
}

#[tokio::test]
async fn webhook_gives_up_with_send_error() {
    let notifier = WebhookNotifier::new("http://127.0.0.1:9/hooks/T0KEN-abc".into())
        .with_timeout(1)
        .with_retries(2)
        .with_backoff_ms(1);
    let notice = ReleaseNotice::from(&release("r1", ReleaseStatus::Approved));
    let err = notifier.send("bob", 0, &notice).await.unwrap_err();
    assert!(matches!(err, NotifyError::Send { ref customer_id, .. } if customer_id == "bob"));
    assert!(!err.to_string().contains("T0KEN"), "{err}");
}

#[tokio::test]
async fn webhook_status_error_hides_hook_token() {
    let app = Router::new().route(
        "/hooks/{token}",
        post(|| async { StatusCode::FORBIDDEN }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let notifier = WebhookNotifier::new(format!("http://{addr}/hooks/T0KEN-abc"))
        .with_retries(1)
        .with_backoff_ms(1);
    let notice = ReleaseNotice::from(&release("r1", ReleaseStatus::Approved));
    let err = notifier.send("carol", 0, &notice).await.unwrap_err();
    let shown = err.to_string();
    assert!(shown.contains("403"), "{shown}");
    assert!(!shown.contains("T0KEN"), "{shown}");
}
