use serde::{Deserialize, Serialize};

use crate::prompts::Language;

/// User input against the form. Every variant is one discrete edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormEvent {
    SelectCategory { category: String },
    SelectLanguage { lang: Language },
    SelectTemplate { id: u32 },
    SelectRatio { id: String },
    SetProductName { value: String },
    SetBrandName { value: String },
    SetPrice { value: String },
    SetDiscount { value: String },
    EditPrompt { text: String },
    ResetPrompt,
}

/// Published to `/api/events` subscribers as session state moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PromptChanged { prompt: String },
    Notice { message: String, is_error: bool },
    GenerationStarted { prompt: String },
    GenerationFinished { mime_type: String },
    GenerationFailed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_events_use_tagged_json() {
        let ev: FormEvent = serde_json::from_str(r#"{"type":"set_price","value":"$29"}"#).unwrap();
        assert_eq!(ev, FormEvent::SetPrice { value: "$29".into() });

        let ev: FormEvent = serde_json::from_str(r#"{"type":"select_language","lang":"bn"}"#).unwrap();
        assert_eq!(ev, FormEvent::SelectLanguage { lang: Language::Bn });

        let ev: FormEvent = serde_json::from_str(r#"{"type":"reset_prompt"}"#).unwrap();
        assert_eq!(ev, FormEvent::ResetPrompt);
    }
}
