//! Integration tests for the dispatch engine and runner
//!
//! These tests use real CSV files and state directories under a TempDir and a
//! scripted in-memory sender to test end to end scenarios, including
//! interrupted and resumed runs.

#[cfg(test)]
mod tests {
    use crate::{
        channels::ChannelConfig,
        dispatch::{
            Checkpoint, Classification, CorruptStatePolicy, DispatchConfigBuilder, DispatchEngine,
            LocalStateStorage, RunLog, RunLogEntries, SendError, Sender, StateKey, StateStorage,
        },
        recipients::{DelimitedConfig, RecipientStore},
        runner::{SendArgs, SendResult, forget_recipient, inspect_state, reset_state, run_send_with_sender},
        template::MessageTemplate,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    // ============ Test Helpers ============

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct SendCall {
        identity: String,
        message: String,
        attachment: Option<PathBuf>,
    }

    /// Sender that records every call and misbehaves on request
    #[derive(Default)]
    struct ScriptedSender {
        calls: Mutex<Vec<SendCall>>,
        fail: HashSet<String>,
        panic_on: HashSet<String>,
        hang_on: HashSet<String>,
        stop_after: Option<(String, watch::Sender<bool>)>,
        closed: AtomicBool,
    }

    impl ScriptedSender {
        fn failing(identities: &[&str]) -> Self {
            Self {
                fail: identities.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn identities(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.identity.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            identity: &str,
            message: &str,
            attachment: Option<&Path>,
        ) -> Result<(), SendError> {
            self.calls.lock().unwrap().push(SendCall {
                identity: identity.to_string(),
                message: message.to_string(),
                attachment: attachment.map(Path::to_path_buf),
            });

            if let Some((trigger, tx)) = &self.stop_after
                && trigger == identity
            {
                let _ = tx.send(true);
            }
            if self.panic_on.contains(identity) {
                panic!("driver crashed on {}", identity);
            }
            if self.hang_on.contains(identity) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(identity) {
                return Err(SendError::Rejected("element not found".to_string()));
            }
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Storage wrapper that starts failing writes after a number of successes
    struct FlakyStorage {
        inner: LocalStateStorage,
        fail_key: StateKey,
        writes_before_failure: AtomicUsize,
    }

    #[async_trait]
    impl StateStorage for FlakyStorage {
        async fn read(&self, key: StateKey) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: StateKey, contents: String) -> anyhow::Result<()> {
            if key == self.fail_key {
                let remaining = self.writes_before_failure.load(Ordering::SeqCst);
                if remaining == 0 {
                    anyhow::bail!("disk full");
                }
                self.writes_before_failure
                    .store(remaining - 1, Ordering::SeqCst);
            }
            self.inner.write(key, contents).await
        }

        async fn remove(&self, key: StateKey) -> anyhow::Result<()> {
            self.inner.remove(key).await
        }

        async fn quarantine(&self, key: StateKey) -> anyhow::Result<String> {
            self.inner.quarantine(key).await
        }

        fn describe(&self, key: StateKey) -> String {
            self.inner.describe(key)
        }
    }

    /// Helper to create a contacts CSV with phone,name columns
    fn create_contacts(dir: &TempDir, rows: &[(&str, &str)]) -> PathBuf {
        let path = dir.path().join("contacts.csv");
        let mut content = String::from("phone,name\n");
        for (phone, name) in rows {
            content.push_str(&format!("{},{}\n", phone, name));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn create_template(dir: &TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("msg.txt");
        std::fs::write(&path, text).unwrap();
        path
    }

    fn send_args(dir: &TempDir, batch_size: usize) -> SendArgs {
        SendArgs {
            source: dir.path().join("contacts.csv"),
            delimited: DelimitedConfig::csv(),
            phone_column: "phone".to_string(),
            template: dir.path().join("msg.txt"),
            state_dir: dir.path().join("state"),
            restart: false,
            strict_state: false,
            batch_size,
            attachment: None,
            send_timeout: Duration::from_secs(5),
            send_interval: Duration::ZERO,
            channel: ChannelConfig::DryRun,
            quiet: true,
        }
    }

    async fn run(args: SendArgs, sender: &Arc<ScriptedSender>) -> SendResult {
        let (_tx, rx) = watch::channel(false);
        run_send_with_sender(args, sender.clone(), rx).await.unwrap()
    }

    fn read_log(dir: &TempDir) -> RunLogEntries {
        let contents = std::fs::read_to_string(dir.path().join("state").join("log.json")).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    fn read_checkpoint(dir: &TempDir) -> Option<i64> {
        let path = dir.path().join("state").join("progress.json");
        let contents = std::fs::read_to_string(path).ok()?;
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        value["last_processed"].as_i64()
    }

    const ABC: &[(&str, &str)] = &[("111", "Ana"), ("222", "Ben"), ("333", "Cy")];

    // ============ Batch Windows & Resumption ============

    #[tokio::test]
    async fn test_two_batches_cover_list_and_clear_checkpoint() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::default());

        let first = run(send_args(&dir, 2), &sender).await;
        assert_eq!(first.report.window, 0..2);
        assert_eq!(first.report.successful, 2);
        assert!(!first.report.exhausted);
        assert_eq!(read_checkpoint(&dir), Some(1));
        assert_eq!(sender.identities(), vec!["111", "222"]);

        let second = run(send_args(&dir, 2), &sender).await;
        assert_eq!(second.report.window, 2..3);
        assert_eq!(second.report.successful, 1);
        assert!(second.report.exhausted);
        assert_eq!(second.report.last_processed, -1);
        assert_eq!(read_checkpoint(&dir), None);
        assert_eq!(sender.identities(), vec!["111", "222", "333"]);

        let log = read_log(&dir);
        assert_eq!(log.successful, vec!["111", "222", "333"]);
        assert!(log.failed.is_empty());
        assert!(log.duplicates.is_empty());
    }

    #[tokio::test]
    async fn test_messages_are_rendered_per_recipient() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, &[("0111", "Ana"), ("222", "Ben")]);
        create_template(&dir, "Hello {name}, we have {phone} on file\n");
        let sender = Arc::new(ScriptedSender::default());

        run(send_args(&dir, 10), &sender).await;

        let calls = sender.calls.lock().unwrap().clone();
        assert_eq!(calls[0].identity, "111");
        assert_eq!(calls[0].message, "Hello Ana, we have 0111 on file");
        assert_eq!(calls[1].message, "Hello Ben, we have 222 on file");
        assert!(sender.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resumed_batches_match_single_pass() {
        let rows: Vec<(String, String)> = (0..11)
            .map(|i| (format!("55500{:02}", i), format!("n{}", i)))
            .collect();
        let rows: Vec<(&str, &str)> = rows.iter().map(|(p, n)| (p.as_str(), n.as_str())).collect();
        let failing = ["5550003", "5550007"];

        let single = TempDir::new().unwrap();
        create_contacts(&single, &rows);
        create_template(&single, "Hi {name}");
        let sender = Arc::new(ScriptedSender::failing(&failing));
        let result = run(send_args(&single, 100), &sender).await;
        assert!(result.report.exhausted);
        let expected = read_log(&single);

        for batch_sizes in [vec![1usize; 11], vec![3, 3, 3, 3], vec![4, 1, 5, 2], vec![10, 10]] {
            let dir = TempDir::new().unwrap();
            create_contacts(&dir, &rows);
            create_template(&dir, "Hi {name}");
            let sender = Arc::new(ScriptedSender::failing(&failing));

            let mut exhausted = false;
            for batch_size in batch_sizes {
                exhausted = run(send_args(&dir, batch_size), &sender).await.report.exhausted;
                if exhausted {
                    break;
                }
            }

            assert!(exhausted);
            assert_eq!(read_log(&dir), expected);
            assert_eq!(sender.calls.lock().unwrap().len(), 11);
        }

        // No identity is both successful and failed
        let successful: HashSet<_> = expected.successful.iter().collect();
        assert!(expected.failed.iter().all(|id| !successful.contains(id)));
        assert_eq!(expected.failed, vec!["5550003", "5550007"]);
    }

    #[tokio::test]
    async fn test_checkpoint_past_end_of_shrunken_list() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(
            dir.path().join("state").join("progress.json"),
            r#"{"last_processed": 8}"#,
        )
        .unwrap();
        let sender = Arc::new(ScriptedSender::default());

        let result = run(send_args(&dir, 2), &sender).await;

        assert_eq!(result.report.processed, 0);
        assert!(result.report.exhausted);
        assert!(sender.identities().is_empty());
        assert_eq!(read_checkpoint(&dir), None);
    }

    // ============ Failures ============

    #[tokio::test]
    async fn test_failed_send_is_terminal_and_not_retried() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::failing(&["222"]));

        let first = run(send_args(&dir, 10), &sender).await;
        assert_eq!(first.report.successful, 2);
        assert_eq!(first.report.failed, 1);
        assert_eq!(first.report.failures[0].identity, "222");
        assert_eq!(first.report.failures[0].index, 1);
        assert_eq!(read_log(&dir).failed, vec!["222"]);

        // Walk the list again from the top with the same log
        let mut args = send_args(&dir, 10);
        args.restart = true;
        let healthy = Arc::new(ScriptedSender::default());
        let second = run(args, &healthy).await;

        assert!(healthy.identities().is_empty());
        assert_eq!(second.report.duplicates, 3);
        assert_eq!(read_log(&dir).duplicates, vec!["111", "222", "333"]);
    }

    #[tokio::test]
    async fn test_panicking_sender_is_recorded_as_failure() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender {
            panic_on: ["111".to_string()].into_iter().collect(),
            ..ScriptedSender::default()
        });

        let result = run(send_args(&dir, 10), &sender).await;

        assert_eq!(result.report.failed, 1);
        assert_eq!(result.report.successful, 2);
        assert!(matches!(
            &result.report.failures[0].error,
            SendError::Panicked(msg) if msg.contains("driver crashed on 111")
        ));
        assert_eq!(read_log(&dir).failed, vec!["111"]);
    }

    #[tokio::test]
    async fn test_hanging_sender_times_out() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender {
            hang_on: ["222".to_string()].into_iter().collect(),
            ..ScriptedSender::default()
        });

        let mut args = send_args(&dir, 10);
        args.send_timeout = Duration::from_millis(50);
        let result = run(args, &sender).await;

        assert_eq!(result.report.failed, 1);
        assert!(matches!(
            result.report.failures[0].error,
            SendError::Timeout(_)
        ));
        assert_eq!(read_log(&dir).successful, vec!["111", "333"]);
    }

    #[tokio::test]
    async fn test_run_log_write_failure_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StateStorage> = Arc::new(FlakyStorage {
            inner: LocalStateStorage::new(dir.path().to_path_buf()),
            fail_key: StateKey::RunLog,
            writes_before_failure: AtomicUsize::new(1),
        });

        let store = RecipientStore::from_reader(
            "phone,name\n111,Ana\n222,Ben\n333,Cy\n".as_bytes(),
            &DelimitedConfig::csv(),
            "phone",
        )
        .unwrap();
        let run_log = RunLog::load(Arc::clone(&storage), CorruptStatePolicy::Recover)
            .await
            .unwrap();
        let checkpoint = Checkpoint::load(Arc::clone(&storage), CorruptStatePolicy::Recover)
            .await
            .unwrap();
        let sender = Arc::new(ScriptedSender::default());
        let config = DispatchConfigBuilder::default()
            .batch_size(10)
            .build()
            .unwrap();

        let mut engine = DispatchEngine::new(
            store,
            MessageTemplate::parse("Hi {name}").unwrap(),
            sender.clone(),
            run_log,
            checkpoint,
            config,
        )
        .unwrap();

        let result = engine.run_batch().await;

        assert!(result.is_err());
        // Second recipient was attempted but could not be recorded
        assert_eq!(sender.identities(), vec!["111", "222"]);
        assert_eq!(engine.checkpoint().current(), 0);
        assert_eq!(engine.run_log().classify("222"), Classification::Unseen);

        let on_disk = Checkpoint::load(storage, CorruptStatePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(on_disk.current(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_resumes_without_resending() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let storage: Arc<dyn StateStorage> = Arc::new(FlakyStorage {
            inner: LocalStateStorage::new(dir.path().join("state")),
            fail_key: StateKey::Checkpoint,
            writes_before_failure: AtomicUsize::new(0),
        });

        let store = RecipientStore::load(
            &dir.path().join("contacts.csv"),
            &DelimitedConfig::csv(),
            "phone",
        )
        .await
        .unwrap();
        let run_log = RunLog::load(Arc::clone(&storage), CorruptStatePolicy::Recover)
            .await
            .unwrap();
        let checkpoint = Checkpoint::load(Arc::clone(&storage), CorruptStatePolicy::Recover)
            .await
            .unwrap();
        let sender = Arc::new(ScriptedSender::default());
        let config = DispatchConfigBuilder::default()
            .batch_size(10)
            .build()
            .unwrap();

        let mut engine = DispatchEngine::new(
            store,
            MessageTemplate::parse("Hi {name}").unwrap(),
            sender.clone(),
            run_log,
            checkpoint,
            config,
        )
        .unwrap();

        assert!(engine.run_batch().await.is_err());
        assert_eq!(sender.identities(), vec!["111"]);
        assert_eq!(engine.run_log().classify("111"), Classification::Successful);
        assert_eq!(engine.checkpoint().current(), -1);
        drop(engine);

        assert_eq!(read_log(&dir).successful, vec!["111"]);
        assert_eq!(read_checkpoint(&dir), None);

        // The resumed run revisits index 0 and skips it
        let resumed = Arc::new(ScriptedSender::default());
        let result = run(send_args(&dir, 10), &resumed).await;

        assert_eq!(resumed.identities(), vec!["222", "333"]);
        assert_eq!(result.report.duplicates, 1);
        let log = read_log(&dir);
        assert_eq!(log.duplicates, vec!["111"]);
        assert_eq!(log.successful, vec!["111", "222", "333"]);
    }

    // ============ Idempotence & Deduplication ============

    #[tokio::test]
    async fn test_rerun_with_complete_log_sends_nothing() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::default());
        assert!(run(send_args(&dir, 10), &sender).await.report.exhausted);

        let again = Arc::new(ScriptedSender::default());
        let result = run(send_args(&dir, 10), &again).await;

        assert!(again.identities().is_empty());
        assert_eq!(result.report.duplicates, 3);
        assert!(result.report.exhausted);
        assert_eq!(result.totals.successful, 3);
    }

    #[tokio::test]
    async fn test_equivalent_numbers_in_one_source_are_sent_once() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, &[("015551234567", "Ana"), ("+1 555 123 4567", "Ana2")]);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::default());

        let result = run(send_args(&dir, 10), &sender).await;

        assert_eq!(sender.identities(), vec!["15551234567"]);
        assert_eq!(result.report.total_recipients, 1);
    }

    #[tokio::test]
    async fn test_equivalent_number_in_later_source_is_a_duplicate() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, &[("015551234567", "Ana")]);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::default());
        run(send_args(&dir, 10), &sender).await;

        create_contacts(&dir, &[("15551234567", "Ana"), ("222", "Ben")]);
        run(send_args(&dir, 10), &sender).await;

        assert_eq!(sender.identities(), vec!["15551234567", "222"]);
        let log = read_log(&dir);
        assert_eq!(log.duplicates, vec!["15551234567"]);
        assert_eq!(log.successful, vec!["15551234567", "222"]);
    }

    // ============ Cancellation ============

    #[tokio::test]
    async fn test_shutdown_stops_at_recipient_boundary() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, &[("111", "A"), ("222", "B"), ("333", "C"), ("444", "D")]);
        create_template(&dir, "Hi {name}");

        let (tx, rx) = watch::channel(false);
        let sender = Arc::new(ScriptedSender {
            stop_after: Some(("222".to_string(), tx)),
            ..ScriptedSender::default()
        });

        let result = run_send_with_sender(send_args(&dir, 10), sender.clone(), rx)
            .await
            .unwrap();

        // The in-flight recipient finishes and is fully recorded
        assert!(result.report.interrupted);
        assert!(!result.report.exhausted);
        assert_eq!(result.report.processed, 2);
        assert_eq!(sender.identities(), vec!["111", "222"]);
        assert_eq!(read_checkpoint(&dir), Some(1));
        assert_eq!(read_log(&dir).successful, vec!["111", "222"]);
        assert!(sender.closed.load(Ordering::SeqCst));

        let resumed = Arc::new(ScriptedSender::default());
        let result = run(send_args(&dir, 10), &resumed).await;
        assert_eq!(resumed.identities(), vec!["333", "444"]);
        assert!(result.report.exhausted);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_send_interval() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");

        let (tx, rx) = watch::channel(false);
        let sender = Arc::new(ScriptedSender {
            stop_after: Some(("111".to_string(), tx)),
            ..ScriptedSender::default()
        });
        let mut args = send_args(&dir, 10);
        args.send_interval = Duration::from_secs(600);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run_send_with_sender(args, sender.clone(), rx),
        )
        .await
        .expect("pause should end on shutdown")
        .unwrap();

        assert!(result.report.interrupted);
        assert_eq!(sender.identities(), vec!["111"]);
    }

    // ============ Validation ============

    #[tokio::test]
    async fn test_template_field_missing_from_source_fails_before_sending() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}, your order {order_id} shipped");
        let sender = Arc::new(ScriptedSender::default());
        let (_tx, rx) = watch::channel(false);

        let err = run_send_with_sender(send_args(&dir, 10), sender.clone(), rx)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("order_id"));
        assert!(sender.identities().is_empty());
        assert!(sender.closed.load(Ordering::SeqCst));
        assert_eq!(read_checkpoint(&dir), None);
    }

    #[tokio::test]
    async fn test_attachment_is_passed_to_sender() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, &[("111", "Ana")]);
        create_template(&dir, "Hi {name}");
        let image = dir.path().join("promo.png");
        std::fs::write(&image, b"png").unwrap();
        let sender = Arc::new(ScriptedSender::default());

        let mut args = send_args(&dir, 10);
        args.attachment = Some(image.clone());
        run(args, &sender).await;

        assert_eq!(sender.calls.lock().unwrap()[0].attachment, Some(image));
    }

    #[tokio::test]
    async fn test_missing_attachment_fails_before_sending() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, &[("111", "Ana")]);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::default());
        let (_tx, rx) = watch::channel(false);

        let mut args = send_args(&dir, 10);
        args.attachment = Some(dir.path().join("missing.png"));

        assert!(run_send_with_sender(args, sender.clone(), rx).await.is_err());
        assert!(sender.identities().is_empty());
    }

    // ============ Corrupt State ============

    #[tokio::test]
    async fn test_corrupt_log_degrades_to_empty_state() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(dir.path().join("state").join("log.json"), "{\"successful\": [").unwrap();
        let sender = Arc::new(ScriptedSender::default());

        let result = run(send_args(&dir, 10), &sender).await;

        assert_eq!(result.report.successful, 3);
        assert_eq!(read_log(&dir).successful, vec!["111", "222", "333"]);
    }

    #[tokio::test]
    async fn test_corrupt_log_is_fatal_in_strict_mode() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(dir.path().join("state").join("log.json"), "garbage").unwrap();
        let sender = Arc::new(ScriptedSender::default());
        let (_tx, rx) = watch::channel(false);

        let mut args = send_args(&dir, 10);
        args.strict_state = true;

        assert!(run_send_with_sender(args, sender.clone(), rx).await.is_err());
        assert!(sender.identities().is_empty());
    }

    // ============ Operator Commands ============

    #[tokio::test]
    async fn test_forget_lets_failed_recipient_be_retried() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::failing(&["222"]));
        run(send_args(&dir, 10), &sender).await;

        let (identity, prior) = forget_recipient(dir.path().join("state"), "0222")
            .await
            .unwrap();
        assert_eq!(identity, "222");
        assert_eq!(prior, Classification::Failed);

        let retry = Arc::new(ScriptedSender::default());
        run(send_args(&dir, 10), &retry).await;

        assert_eq!(retry.identities(), vec!["222"]);
        let log = read_log(&dir);
        assert!(log.failed.is_empty());
        assert_eq!(log.successful, vec!["111", "333", "222"]);
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let dir = TempDir::new().unwrap();
        create_contacts(&dir, ABC);
        create_template(&dir, "Hi {name}");
        let sender = Arc::new(ScriptedSender::failing(&["111"]));
        run(send_args(&dir, 2), &sender).await;

        let state_dir = dir.path().join("state");
        let summary = inspect_state(state_dir.clone()).await.unwrap();
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.last_processed, 1);
        assert!(summary.has_pending_checkpoint());

        reset_state(state_dir.clone(), false).await.unwrap();
        let summary = inspect_state(state_dir.clone()).await.unwrap();
        assert!(!summary.has_pending_checkpoint());
        assert_eq!(summary.successful, 1);

        reset_state(state_dir.clone(), true).await.unwrap();
        let summary = inspect_state(state_dir).await.unwrap();
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.failed, 0);
    }
}
