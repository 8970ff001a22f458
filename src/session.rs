use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::events::{FormEvent, SessionEvent};
use crate::form::{FormError, FormState, ImageUpload, SubmitError, Submission, UploadError, UploadSlot};
use crate::generate::{generate_ad_image, GenerationError, ImageDataUri};
use crate::prompts::{Catalog, Language};
use crate::providers::ImageGenerator;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub message: String,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub uri: ImageDataUri,
    pub prompt: String,
    pub product_file: String,
    pub category: String,
    pub template_id: u32,
    pub lang: Language,
    pub ratio_id: String,
    pub created_at: DateTime<Utc>,
}

/// Form state plus everything the output panel shows.
pub struct Session {
    form: FormState,
    loading: bool,
    generated: Option<GeneratedImage>,
    error: Option<String>,
    notice: Option<Notice>,
    events: Option<broadcast::Sender<SessionEvent>>,
}

impl Session {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            form: FormState::new(catalog),
            loading: false,
            generated: None,
            error: None,
            notice: None,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, ev: SessionEvent) {
        if let Some(tx) = &self.events {
            // no subscribers is fine
            let _ = tx.send(ev);
        }
    }

    fn notify(&mut self, message: impl Into<String>, is_error: bool) {
        let message = message.into();
        self.emit(SessionEvent::Notice { message: message.clone(), is_error });
        self.notice = Some(Notice { message, is_error });
    }

    pub fn form(&self) -> &FormState {
        &self.form
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn generated(&self) -> Option<&GeneratedImage> {
        self.generated.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn apply(&mut self, event: FormEvent) -> Result<(), FormError> {
        let before = self.form.editable_prompt().to_string();
        let is_reset = matches!(event, FormEvent::ResetPrompt);
        self.form.apply(event)?;
        if is_reset {
            self.notify("Prompt has been reset to the template.", false);
        }
        if self.form.editable_prompt() != before {
            self.emit(SessionEvent::PromptChanged { prompt: self.form.editable_prompt().to_string() });
        }
        Ok(())
    }

    /// A new product photo invalidates the previous output.
    pub fn upload_product(&mut self, upload: ImageUpload) -> Result<(), UploadError> {
        self.form.set_image(UploadSlot::Product, Some(upload))?;
        self.generated = None;
        self.error = None;
        Ok(())
    }

    pub fn clear_product(&mut self) {
        let _ = self.form.set_image(UploadSlot::Product, None);
        self.generated = None;
        self.error = None;
    }

    pub fn upload_logo(&mut self, upload: ImageUpload) -> Result<(), UploadError> {
        self.form.set_image(UploadSlot::Logo, Some(upload))
    }

    pub fn clear_logo(&mut self) {
        let _ = self.form.set_image(UploadSlot::Logo, None);
    }

    /// Validates and flips the loading flag. Validation failures only raise a
    /// notice; the inline error and loading flag are left alone.
    pub fn begin_submission(&mut self) -> Result<Submission, SubmitError> {
        if self.loading {
            return Err(SubmitError::Busy);
        }
        let submission = self.form.validate_submission().inspect_err(|e| self.notify(e.to_string(), true))?;
        self.loading = true;
        self.error = None;
        self.emit(SessionEvent::GenerationStarted { prompt: submission.prompt.clone() });
        Ok(submission)
    }

    pub fn finish_submission(&mut self, submission: &Submission, result: &Result<ImageDataUri, GenerationError>) {
        self.loading = false;
        match result {
            Ok(uri) => {
                self.emit(SessionEvent::GenerationFinished { mime_type: uri.mime_type.clone() });
                self.generated = Some(GeneratedImage {
                    uri: uri.clone(),
                    prompt: submission.prompt.clone(),
                    product_file: submission.product.name.clone(),
                    category: self.form.category().to_string(),
                    template_id: self.form.template_id(),
                    lang: self.form.lang(),
                    ratio_id: self.form.ratio_id().to_string(),
                    created_at: Utc::now(),
                });
                self.notify("Ad image generated successfully!", false);
            }
            Err(e) => {
                let msg = e.to_string();
                self.emit(SessionEvent::GenerationFailed { error: msg.clone() });
                self.error = Some(msg.clone());
                self.notify(msg, true);
            }
        }
    }

    /// The in-flight call went away without a result. Nothing is recorded;
    /// the session just stops loading.
    pub fn abandon_submission(&mut self) {
        if !self.loading {
            return;
        }
        self.loading = false;
        tracing::warn!("generation abandoned before the provider replied");
        self.emit(SessionEvent::GenerationFailed { error: "Generation was cancelled.".into() });
    }

    pub fn view(&self) -> SessionView {
        let form = &self.form;
        SessionView {
            category: form.category().to_string(),
            lang: form.lang(),
            template_id: form.template_id(),
            ratio_id: form.ratio_id().to_string(),
            product_name: form.product_name().to_string(),
            brand_name: form.brand_name().to_string(),
            price: form.price().to_string(),
            discount: form.discount().to_string(),
            base_prompt: form.base_prompt(),
            editable_prompt: form.editable_prompt().to_string(),
            product_image: form.product_image().map(UploadView::from),
            logo_image: form.logo_image().map(UploadView::from),
            loading: self.loading,
            generated_image: self.generated.as_ref().map(|g| g.uri.to_string()),
            error: self.error.clone(),
            notice: self.notice.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadView {
    pub name: String,
    pub mime_type: String,
    pub size: usize,
}

impl From<&ImageUpload> for UploadView {
    fn from(u: &ImageUpload) -> Self {
        Self { name: u.name.clone(), mime_type: u.mime_type.clone(), size: u.bytes.len() }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub category: String,
    pub lang: Language,
    pub template_id: u32,
    pub ratio_id: String,
    pub product_name: String,
    pub brand_name: String,
    pub price: String,
    pub discount: String,
    pub base_prompt: String,
    pub editable_prompt: String,
    pub product_image: Option<UploadView>,
    pub logo_image: Option<UploadView>,
    pub loading: bool,
    pub generated_image: Option<String>,
    pub error: Option<String>,
    pub notice: Option<Notice>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitFailure {
    #[error(transparent)]
    Rejected(#[from] SubmitError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Clears the loading flag if the submit future is dropped before the
/// generator returns.
struct InFlight<'a> {
    session: &'a Mutex<Session>,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.lock().abandon_submission();
        }
    }
}

/// Runs one submission against a shared session. The lock is released for
/// the duration of the generator call. Dropping the returned future abandons
/// the call and frees the session for the next submission.
pub async fn submit(session: &Mutex<Session>, generator: &dyn ImageGenerator) -> Result<ImageDataUri, SubmitFailure> {
    let submission = {
        let mut s = session.lock();
        s.begin_submission()?
    };
    let mut guard = InFlight { session, armed: true };
    tracing::info!(
        provider = generator.name(),
        model = generator.model(),
        with_logo = submission.logo.is_some(),
        "generating ad image"
    );
    let result = generate_ad_image(generator, &submission.prompt, &submission.product, submission.logo.as_ref()).await;
    guard.armed = false;
    {
        let mut s = session.lock();
        s.finish_submission(&submission, &result);
    }
    result.map_err(SubmitFailure::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::tests::FakeGenerator;
    use crate::providers::{GenerationResponse, ProviderError};

    fn session() -> Session {
        Session::new(Arc::new(Catalog::builtin().unwrap()))
    }

    fn photo() -> ImageUpload {
        ImageUpload::new("wallet.jpg", "image/jpeg", vec![1, 2, 3])
    }

    fn ready(s: &mut Session) {
        s.upload_product(photo()).unwrap();
        s.apply(FormEvent::EditPrompt { text: "Feature Wallet".into() }).unwrap();
    }

    #[test]
    fn validation_failure_sets_error_notice_only() {
        let mut s = session();
        let err = s.begin_submission().unwrap_err();
        assert_eq!(err, SubmitError::MissingImage);
        assert!(!s.is_loading());
        assert!(s.error().is_none());
        assert_eq!(
            s.notice(),
            Some(&Notice { message: "Please upload a product photo first.".into(), is_error: true })
        );
    }

    #[test]
    fn second_submission_is_rejected_while_loading() {
        let mut s = session();
        ready(&mut s);
        s.begin_submission().unwrap();
        assert!(s.is_loading());
        assert_eq!(s.begin_submission().unwrap_err(), SubmitError::Busy);
    }

    #[test]
    fn failure_is_kept_inline_until_next_attempt_or_clear() {
        let mut s = session();
        ready(&mut s);
        let sub = s.begin_submission().unwrap();
        s.finish_submission(&sub, &Err(GenerationError::Blocked("SAFETY".into())));
        assert!(!s.is_loading());
        assert!(s.error().unwrap().contains("Image generation blocked: SAFETY"));
        assert!(s.notice().unwrap().is_error);

        s.begin_submission().unwrap();
        assert!(s.error().is_none());

        let sub = s.form().validate_submission().unwrap();
        s.finish_submission(&sub, &Err(GenerationError::NoImage));
        assert!(s.error().is_some());
        s.clear_product();
        assert!(s.error().is_none());
        assert!(s.form().product_image().is_none());
    }

    #[test]
    fn new_photo_clears_previous_output() {
        let mut s = session();
        ready(&mut s);
        let sub = s.begin_submission().unwrap();
        let uri = ImageDataUri { mime_type: "image/png".into(), data: "abc123".into() };
        s.finish_submission(&sub, &Ok(uri));
        assert_eq!(s.view().generated_image.as_deref(), Some("data:image/png;base64,abc123"));
        assert_eq!(s.generated().unwrap().product_file, "wallet.jpg");

        s.upload_product(ImageUpload::new("bag.png", "image/png", vec![9])).unwrap();
        assert!(s.generated().is_none());
    }

    #[test]
    fn logo_changes_leave_output_alone() {
        let mut s = session();
        ready(&mut s);
        let sub = s.begin_submission().unwrap();
        s.finish_submission(&sub, &Err(GenerationError::NoImage));
        s.upload_logo(ImageUpload::new("logo.webp", "image/webp", vec![1])).unwrap();
        s.clear_logo();
        assert!(s.error().is_some());
    }

    #[test]
    fn reset_raises_notice_and_emits_prompt() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut s = session().with_events(tx);
        s.apply(FormEvent::EditPrompt { text: "custom".into() }).unwrap();
        s.apply(FormEvent::ResetPrompt).unwrap();
        assert_eq!(s.notice().unwrap().message, "Prompt has been reset to the template.");
        assert_eq!(s.form().editable_prompt(), s.form().base_prompt());

        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::PromptChanged { prompt } if prompt == "custom"));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Notice { is_error: false, .. }));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::PromptChanged { .. }));
    }

    #[tokio::test]
    async fn submit_round_trip_with_fake_generator() {
        let shared = Mutex::new(session());
        ready(&mut shared.lock());
        let gen = FakeGenerator::image("image/png", "abc123");
        let uri = submit(&shared, &gen).await.unwrap();
        assert_eq!(uri.to_string(), "data:image/png;base64,abc123");

        let s = shared.lock();
        assert!(!s.is_loading());
        assert_eq!(s.notice().unwrap().message, "Ad image generated successfully!");
    }

    #[tokio::test]
    async fn submit_surfaces_generation_errors() {
        let shared = Mutex::new(session());
        ready(&mut shared.lock());
        let gen = FakeGenerator::replying(Ok(GenerationResponse {
            parts: vec![],
            block_reason: Some("SAFETY".into()),
        }));
        let err = submit(&shared, &gen).await.unwrap_err();
        assert!(matches!(err, SubmitFailure::Generation(GenerationError::Blocked(_))));
        assert!(shared.lock().error().unwrap().starts_with("API Error: Image generation blocked: SAFETY"));
    }

    #[tokio::test]
    async fn submit_does_not_call_generator_on_validation_failure() {
        let shared = Mutex::new(session());
        let gen = FakeGenerator::replying(Err(ProviderError::Fatal("unused".into())));
        let err = submit(&shared, &gen).await.unwrap_err();
        assert!(matches!(err, SubmitFailure::Rejected(SubmitError::MissingImage)));
        assert!(gen.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn dropped_submit_frees_the_session() {
        let (tx, mut rx) = broadcast::channel(16);
        let shared = Mutex::new(session().with_events(tx));
        ready(&mut shared.lock());
        while rx.try_recv().is_ok() {}
        let gen = FakeGenerator::image("image/png", "abc123").delayed(std::time::Duration::from_secs(3600));

        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), submit(&shared, &gen)).await;
        assert!(timed_out.is_err());

        let mut s = shared.lock();
        assert!(!s.is_loading());
        assert!(s.generated().is_none());
        assert!(s.error().is_none());
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::GenerationStarted { .. }));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::GenerationFailed { .. }));
        assert!(s.begin_submission().is_ok());
    }

    #[test]
    fn abandon_is_a_no_op_when_idle() {
        let mut s = session();
        s.abandon_submission();
        assert!(!s.is_loading());
        assert!(s.notice().is_none());
    }
}
