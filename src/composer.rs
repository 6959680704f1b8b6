use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::api::{ApiError, MessageStore, OutboundMessage};
use crate::models::{AttachmentKind, UserId};
use crate::notify::Notifier;
use crate::selector::ConversationSelector;
use crate::sync::SyncEngine;
use crate::upload::{UploadError, UploadFile, Uploader};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("send failed: {0}")]
    Transport(#[from] ApiError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyText,
    NoActiveConversation,
    UploadInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Skipped(SkipReason),
}

/// Routes outbound messages to the active conversation and refreshes the
/// timeline after each successful send. The refresh polls the conversation
/// the message went to; it is a no-op once the engine has moved elsewhere.
pub struct MessageComposer<S, U, N> {
    me: UserId,
    store: Arc<S>,
    uploader: U,
    selector: Arc<ConversationSelector>,
    engine: Arc<SyncEngine<S, N>>,
    draft: Mutex<String>,
    uploading: AtomicBool,
}

impl<S, U, N> MessageComposer<S, U, N>
where
    S: MessageStore + 'static,
    U: Uploader,
    N: Notifier + 'static,
{
    pub fn new(
        me: UserId,
        store: Arc<S>,
        uploader: U,
        selector: Arc<ConversationSelector>,
        engine: Arc<SyncEngine<S, N>>,
    ) -> Self {
        Self {
            me,
            store,
            uploader,
            selector,
            engine,
            draft: Mutex::new(String::new()),
            uploading: AtomicBool::new(false),
        }
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        *self.draft.lock().unwrap_or_else(PoisonError::into_inner) = text.into();
    }

    pub fn draft(&self) -> String {
        self.draft.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::SeqCst)
    }

    pub async fn send_draft(&self) -> Result<SendOutcome, ComposeError> {
        let text = self.draft();
        self.send_text(&text).await
    }

    pub async fn send_text(&self, text: &str) -> Result<SendOutcome, ComposeError> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Skipped(SkipReason::EmptyText));
        }
        let Some(target) = self.selector.active() else {
            return Ok(SendOutcome::Skipped(SkipReason::NoActiveConversation));
        };

        self.store
            .send_message(self.me, target, &OutboundMessage::text(text))
            .await
            .inspect_err(|err| tracing::warn!(conversation = %target, error = %err, "text send failed"))?;
        self.set_draft(String::new());
        self.engine.poll_once(target).await;
        Ok(SendOutcome::Sent)
    }

    pub async fn send_attachment(&self, file: UploadFile) -> Result<SendOutcome, ComposeError> {
        let kind = AttachmentKind::for_mime(file.mime_type.as_deref());
        let file_name = file.file_name.clone();
        self.upload_and_send(file, |url| OutboundMessage {
            content: kind.placeholder().to_string(),
            file_url: Some(url),
            file_name: Some(file_name),
            ..OutboundMessage::default()
        })
        .await
    }

    pub async fn send_voice(&self, audio: Vec<u8>, duration_secs: u32) -> Result<SendOutcome, ComposeError> {
        self.upload_and_send(UploadFile::voice(audio), |url| OutboundMessage {
            content: AttachmentKind::Voice.placeholder().to_string(),
            voice_url: Some(url),
            voice_duration: Some(duration_secs),
            ..OutboundMessage::default()
        })
        .await
    }

    async fn upload_and_send(
        &self,
        file: UploadFile,
        build: impl FnOnce(String) -> OutboundMessage,
    ) -> Result<SendOutcome, ComposeError> {
        let Some(target) = self.selector.active() else {
            return Ok(SendOutcome::Skipped(SkipReason::NoActiveConversation));
        };
        let Some(_uploading) = UploadingGuard::acquire(&self.uploading) else {
            return Ok(SendOutcome::Skipped(SkipReason::UploadInProgress));
        };

        let url = self
            .uploader
            .upload(file)
            .await
            .inspect_err(|err| tracing::warn!(conversation = %target, error = %err, "attachment upload failed"))?;
        self.store
            .send_message(self.me, target, &build(url))
            .await
            .inspect_err(|err| tracing::warn!(conversation = %target, error = %err, "attachment send failed"))?;
        self.engine.poll_once(target).await;
        Ok(SendOutcome::Sent)
    }
}

/// Holds the uploading flag for one upload; clears it on every exit path.
struct UploadingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> UploadingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for UploadingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Target;
    use crate::sync::tests::{CountingNotifier, FakeStore, messages};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeUploader {
        uploads: AtomicUsize,
        fail: AtomicBool,
        pause: AtomicBool,
        started: Notify,
        release: Notify,
    }

    impl Uploader for Arc<FakeUploader> {
        async fn upload(&self, file: UploadFile) -> Result<String, UploadError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.pause.load(Ordering::SeqCst) {
                self.started.notify_one();
                self.release.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(UploadError::Status(503));
            }
            Ok(crate::upload::download_url(&format!("https://tmpfiles.org/42/{}", file.file_name)))
        }
    }

    type Composer = MessageComposer<FakeStore, Arc<FakeUploader>, CountingNotifier>;

    struct Fixture {
        store: Arc<FakeStore>,
        uploader: Arc<FakeUploader>,
        selector: Arc<ConversationSelector>,
        engine: Arc<SyncEngine<FakeStore, CountingNotifier>>,
        composer: Arc<Composer>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(FakeStore::default());
        let uploader = Arc::new(FakeUploader::default());
        let selector = Arc::new(ConversationSelector::new());
        let engine = Arc::new(SyncEngine::new(
            1,
            Arc::clone(&store),
            CountingNotifier::default(),
            Duration::from_secs(3600),
        ));
        let composer = Arc::new(MessageComposer::new(
            1,
            Arc::clone(&store),
            Arc::clone(&uploader),
            Arc::clone(&selector),
            Arc::clone(&engine),
        ));
        Fixture {
            store,
            uploader,
            selector,
            engine,
            composer,
        }
    }

    fn select(fixture: &Fixture, target: Target) {
        let selection = fixture.selector.select(target);
        fixture.engine.apply(selection);
    }

    fn png() -> UploadFile {
        UploadFile {
            file_name: "cat.png".to_string(),
            mime_type: Some("image/png".to_string()),
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn blank_text_never_reaches_the_store() {
        let fixture = fixture();
        select(&fixture, Target::Direct(2));

        for text in ["", "   ", "\n\t"] {
            let outcome = fixture.composer.send_text(text).await.expect("skip");
            assert_eq!(outcome, SendOutcome::Skipped(SkipReason::EmptyText));
        }
        assert!(fixture.store.sent().is_empty());
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn text_without_active_conversation_is_skipped() {
        let fixture = fixture();
        let outcome = fixture.composer.send_text("hello").await.expect("skip");
        assert_eq!(outcome, SendOutcome::Skipped(SkipReason::NoActiveConversation));
        assert!(fixture.store.sent().is_empty());
    }

    #[tokio::test]
    async fn text_is_routed_by_domain_and_refreshes_timeline() {
        let fixture = fixture();
        select(&fixture, Target::Group(5));
        fixture.composer.set_draft("hi group");

        let outcome = fixture.composer.send_draft().await.expect("sent");

        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(fixture.composer.draft(), "");
        let sent = fixture.store.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Target::Group(5));
        assert_eq!(sent[0].1, OutboundMessage::text("hi group"));
        assert!(fixture.engine.timeline().iter().any(|message| message.content == "hi group"));
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn failed_text_send_keeps_draft() {
        let fixture = fixture();
        select(&fixture, Target::Direct(2));
        fixture.store.fail_sends.store(true, Ordering::SeqCst);
        fixture.composer.set_draft("retry me");

        let err = fixture.composer.send_draft().await.expect_err("transport failure");
        assert!(matches!(err, ComposeError::Transport(_)));
        assert_eq!(fixture.composer.draft(), "retry me");
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn image_attachment_uses_placeholder_and_download_url() {
        let fixture = fixture();
        select(&fixture, Target::Direct(2));

        let outcome = fixture.composer.send_attachment(png()).await.expect("sent");

        assert_eq!(outcome, SendOutcome::Sent);
        assert!(!fixture.composer.is_uploading());
        let sent = fixture.store.sent();
        assert_eq!(sent[0].1.content, "🖼️ Image");
        assert_eq!(sent[0].1.file_url.as_deref(), Some("https://tmpfiles.org/dl/42/cat.png"));
        assert_eq!(sent[0].1.file_name.as_deref(), Some("cat.png"));
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn non_image_attachment_is_a_file() {
        let fixture = fixture();
        select(&fixture, Target::Group(3));
        let file = UploadFile {
            file_name: "notes.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
            bytes: vec![0],
        };

        fixture.composer.send_attachment(file).await.expect("sent");
        assert_eq!(fixture.store.sent()[0].1.content, "📎 File");
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn failed_upload_sends_nothing_and_resets_flag() {
        let fixture = fixture();
        select(&fixture, Target::Direct(2));
        fixture.uploader.fail.store(true, Ordering::SeqCst);

        let err = fixture.composer.send_attachment(png()).await.expect_err("upload failure");

        assert!(matches!(err, ComposeError::Upload(_)));
        assert!(!fixture.composer.is_uploading());
        assert!(fixture.store.sent().is_empty());
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn failed_send_after_upload_resets_flag() {
        let fixture = fixture();
        select(&fixture, Target::Direct(2));
        fixture.store.fail_sends.store(true, Ordering::SeqCst);

        let err = fixture.composer.send_attachment(png()).await.expect_err("send failure");

        assert!(matches!(err, ComposeError::Transport(_)));
        assert!(!fixture.composer.is_uploading());
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn second_upload_is_skipped_while_first_is_in_flight() {
        let fixture = fixture();
        select(&fixture, Target::Direct(2));
        fixture.uploader.pause.store(true, Ordering::SeqCst);

        let first = tokio::spawn({
            let composer = Arc::clone(&fixture.composer);
            async move { composer.send_attachment(png()).await }
        });
        fixture.uploader.started.notified().await;
        assert!(fixture.composer.is_uploading());

        let second = fixture.composer.send_voice(vec![9], 3).await.expect("skip");
        assert_eq!(second, SendOutcome::Skipped(SkipReason::UploadInProgress));

        fixture.uploader.release.notify_one();
        assert_eq!(first.await.expect("join").expect("sent"), SendOutcome::Sent);
        assert!(!fixture.composer.is_uploading());
        assert_eq!(fixture.uploader.uploads.load(Ordering::SeqCst), 1);
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn voice_message_carries_duration() {
        let fixture = fixture();
        fixture.store.set(Target::Direct(2), messages(2));
        select(&fixture, Target::Direct(2));

        fixture.composer.send_voice(vec![1, 2], 7).await.expect("sent");

        let sent = fixture.store.sent();
        assert_eq!(sent[0].1.content, "🎤 Voice message");
        assert_eq!(sent[0].1.voice_url.as_deref(), Some("https://tmpfiles.org/dl/42/voice.webm"));
        assert_eq!(sent[0].1.voice_duration, Some(7));
        assert_eq!(fixture.engine.timeline().len(), 3);
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn send_right_after_switch_lands_in_new_timeline() {
        let fixture = fixture();
        fixture.store.set(Target::Group(5), messages(7));
        select(&fixture, Target::Group(5));
        fixture.engine.force_refresh().await;
        assert_eq!(fixture.engine.cursor(), 7);

        select(&fixture, Target::Direct(2));
        let outcome = fixture.composer.send_text("hi B").await.expect("sent");

        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(fixture.store.sent()[0].0, Target::Direct(2));
        assert_eq!(fixture.engine.active(), Some(Target::Direct(2)));
        let timeline = fixture.engine.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].content, "hi B");
        assert_eq!(fixture.engine.cursor(), 1);
        fixture.engine.stop();
    }

    #[tokio::test]
    async fn refresh_after_send_never_polls_another_conversation() {
        let fixture = fixture();
        fixture.store.set(Target::Group(5), messages(3));
        select(&fixture, Target::Group(5));
        // let the loop take its immediate first tick
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fetches = fixture.store.fetches.load(Ordering::SeqCst);

        // selector moves on without the engine being told
        fixture.selector.select_direct(2);
        fixture.composer.send_text("hi B").await.expect("sent");

        assert_eq!(fixture.store.sent()[0].0, Target::Direct(2));
        assert_eq!(fixture.engine.active(), Some(Target::Group(5)));
        assert_eq!(fixture.store.fetches.load(Ordering::SeqCst), fetches);
        assert!(!fixture.engine.timeline().iter().any(|message| message.content == "hi B"));
        fixture.engine.stop();
    }
}
