use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use thiserror::Error;

use crate::events::FormEvent;
use crate::prompts::{compose, humanize, placeholders, Catalog, Language, PromptFields, Template};

const LOGO_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/svg+xml"];

/// A user-picked image file held in memory.
#[derive(Clone, PartialEq)]
pub struct ImageUpload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUpload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageUpload {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), mime_type: mime_type.into(), bytes }
    }

    /// File name up to the first dot.
    pub fn base_name(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSlot {
    Product,
    Logo,
}

impl UploadSlot {
    pub fn accepts(&self, mime_type: &str) -> bool {
        match self {
            UploadSlot::Product => mime_type.starts_with("image/"),
            UploadSlot::Logo => LOGO_MIME_TYPES.contains(&mime_type),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("'{name}' is not an accepted {slot} image type ({mime_type})")]
    UnsupportedType { name: String, slot: &'static str, mime_type: String },
    #[error("'{0}' is empty")]
    Empty(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum FormError {
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
    #[error("template {id} is not part of category '{category}'")]
    UnknownTemplate { id: u32, category: String },
    #[error("unknown ratio '{0}'")]
    UnknownRatio(String),
}

/// Validation failures and the in-flight guard, reported before any call is
/// attempted.
#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("Please upload a product photo first.")]
    MissingImage,
    #[error("Please fill in the required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("An ad image is already being generated.")]
    Busy,
}

/// Everything the adapter needs for one generation call.
#[derive(Debug, Clone)]
pub struct Submission {
    pub prompt: String,
    pub product: ImageUpload,
    pub logo: Option<ImageUpload>,
}

#[derive(Debug, Clone)]
pub struct FormState {
    catalog: Arc<Catalog>,
    category: String,
    lang: Language,
    template_id: u32,
    ratio_id: String,
    product_name: String,
    brand_name: String,
    price: String,
    discount: String,
    product_image: Option<ImageUpload>,
    logo_image: Option<ImageUpload>,
    editable_prompt: String,
}

impl FormState {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let category = catalog.default_category().to_string();
        let template_id = catalog.templates(&category).first().map(|t| t.id).unwrap_or(1);
        let ratio_id = catalog.default_ratio().to_string();
        let mut form = Self {
            catalog,
            category,
            lang: Language::default(),
            template_id,
            ratio_id,
            product_name: String::new(),
            brand_name: String::new(),
            price: String::new(),
            discount: String::new(),
            product_image: None,
            logo_image: None,
            editable_prompt: String::new(),
        };
        form.recompose();
        form
    }

    /// Applies one input event. Any change to template selection, language,
    /// category or a substitution field rewrites the editable prompt from the
    /// base, dropping manual edits.
    pub fn apply(&mut self, event: FormEvent) -> Result<(), FormError> {
        match event {
            FormEvent::SelectCategory { category } => {
                if !self.catalog.has_category(&category) {
                    return Err(FormError::UnknownCategory(category));
                }
                self.category = category;
                let templates = self.catalog.templates(&self.category);
                if !templates.iter().any(|t| t.id == self.template_id) {
                    if let Some(first) = templates.first() {
                        self.template_id = first.id;
                    }
                }
            }
            FormEvent::SelectLanguage { lang } => self.lang = lang,
            FormEvent::SelectTemplate { id } => {
                if !self.templates().iter().any(|t| t.id == id) {
                    return Err(FormError::UnknownTemplate { id, category: self.category.clone() });
                }
                self.template_id = id;
            }
            FormEvent::SelectRatio { id } => {
                if !self.catalog.has_ratio(&id) {
                    return Err(FormError::UnknownRatio(id));
                }
                self.ratio_id = id;
                return Ok(());
            }
            FormEvent::SetProductName { value } => self.product_name = value,
            FormEvent::SetBrandName { value } => self.brand_name = value,
            FormEvent::SetPrice { value } => self.price = value,
            FormEvent::SetDiscount { value } => self.discount = value,
            FormEvent::EditPrompt { text } => {
                self.editable_prompt = text;
                return Ok(());
            }
            FormEvent::ResetPrompt => {}
        }
        self.recompose();
        Ok(())
    }

    fn recompose(&mut self) {
        self.editable_prompt = self.base_prompt();
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn templates(&self) -> &[Template] {
        self.catalog.templates(&self.category)
    }

    /// The selected template, or the first of the category when the id is
    /// stale.
    pub fn selected_template(&self) -> Option<&Template> {
        let templates = self.templates();
        templates.iter().find(|t| t.id == self.template_id).or_else(|| templates.first())
    }

    pub fn base_prompt(&self) -> String {
        let Some(template) = self.selected_template() else {
            return String::new();
        };
        compose(
            template.body(self.lang),
            &PromptFields {
                product_name: &self.product_name,
                brand_name: &self.brand_name,
                price: &self.price,
                discount: &self.discount,
            },
        )
    }

    pub fn editable_prompt(&self) -> &str {
        &self.editable_prompt
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn lang(&self) -> Language {
        self.lang
    }

    pub fn template_id(&self) -> u32 {
        self.template_id
    }

    pub fn ratio_id(&self) -> &str {
        &self.ratio_id
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn brand_name(&self) -> &str {
        &self.brand_name
    }

    pub fn price(&self) -> &str {
        &self.price
    }

    pub fn discount(&self) -> &str {
        &self.discount
    }

    pub fn product_image(&self) -> Option<&ImageUpload> {
        self.product_image.as_ref()
    }

    pub fn logo_image(&self) -> Option<&ImageUpload> {
        self.logo_image.as_ref()
    }

    pub fn set_image(&mut self, slot: UploadSlot, upload: Option<ImageUpload>) -> Result<(), UploadError> {
        if let Some(u) = &upload {
            check_upload(slot, u)?;
        }
        match slot {
            UploadSlot::Product => self.product_image = upload,
            UploadSlot::Logo => self.logo_image = upload,
        }
        Ok(())
    }

    /// Checks the photo is present and no placeholder is left in the editable
    /// prompt.
    pub fn validate_submission(&self) -> Result<Submission, SubmitError> {
        let product = self.product_image.clone().ok_or(SubmitError::MissingImage)?;
        let missing = placeholders(&self.editable_prompt);
        if !missing.is_empty() {
            return Err(SubmitError::MissingFields(missing.into_iter().map(humanize).collect()));
        }
        Ok(Submission {
            prompt: self.editable_prompt.clone(),
            product,
            logo: self.logo_image.clone(),
        })
    }
}

fn check_upload(slot: UploadSlot, upload: &ImageUpload) -> Result<(), UploadError> {
    if upload.bytes.is_empty() {
        return Err(UploadError::Empty(upload.name.clone()));
    }
    if !slot.accepts(&upload.mime_type) {
        return Err(UploadError::UnsupportedType {
            name: upload.name.clone(),
            slot: match slot {
                UploadSlot::Product => "product",
                UploadSlot::Logo => "logo",
            },
            mime_type: upload.mime_type.clone(),
        });
    }
    Ok(())
}
