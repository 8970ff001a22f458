use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, str::FromStr, sync::LazyLock};

const BUILTIN_CATALOG: &str = include_str!("../assets/catalog.yaml");

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[a-zA-Z_]+\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Bn,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Language::En),
            "bn" | "bangla" | "bengali" => Ok(Language::Bn),
            other => Err(format!("unknown language '{other}' (expected en or bn)")),
        }
    }
}

/// A prompt body per language. Bodies carry `{placeholder}` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: u32,
    pub en: String,
    pub bn: String,
}

impl Template {
    pub fn body(&self, lang: Language) -> &str {
        match lang {
            Language::En => &self.en,
            Language::Bn => &self.bn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ratio {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryTemplates {
    pub name: String,
    #[serde(default)]
    pub templates: Vec<Template>,
}

/// Static template configuration. Category order is display order; the
/// first category and the first ratio are the session defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub categories: Vec<CategoryTemplates>,
    pub ratios: Vec<Ratio>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CATALOG).context("built-in catalog is invalid")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let txt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        Self::from_yaml(&txt).with_context(|| format!("Failed to parse catalog: {}", path.display()))
    }

    pub fn from_yaml(txt: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(txt)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            bail!("catalog must define at least one category");
        }
        if self.ratios.is_empty() {
            bail!("catalog must define at least one ratio");
        }
        let mut names = HashSet::new();
        for cat in &self.categories {
            if !names.insert(cat.name.as_str()) {
                bail!("duplicate category '{}'", cat.name);
            }
            let mut ids = HashSet::new();
            for t in &cat.templates {
                if !ids.insert(t.id) {
                    bail!("duplicate template id {} in category '{}'", t.id, cat.name);
                }
            }
        }
        Ok(())
    }

    pub fn has_category(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c.name == name)
    }

    /// Templates of a category; an unknown category yields an empty set.
    pub fn templates(&self, category: &str) -> &[Template] {
        self.categories
            .iter()
            .find(|c| c.name == category)
            .map(|c| c.templates.as_slice())
            .unwrap_or(&[])
    }

    pub fn default_category(&self) -> &str {
        &self.categories[0].name
    }

    pub fn default_ratio(&self) -> &str {
        &self.ratios[0].id
    }

    pub fn has_ratio(&self, id: &str) -> bool {
        self.ratios.iter().any(|r| r.id == id)
    }
}

/// Values substituted into a template body.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptFields<'a> {
    pub product_name: &'a str,
    pub brand_name: &'a str,
    pub price: &'a str,
    pub discount: &'a str,
}

/// Substitutes the known placeholders into `body`.
///
/// Empty product name and discount keep their literal token so the user sees
/// what is still missing. Empty brand name and price collapse to nothing and
/// never block submission.
pub fn compose(body: &str, fields: &PromptFields<'_>) -> String {
    fn or_token<'a>(value: &'a str, token: &'a str) -> &'a str {
        if value.is_empty() { token } else { value }
    }
    body.replace("{product_name}", or_token(fields.product_name, "{product_name}"))
        .replace("{discount}", or_token(fields.discount, "{discount}"))
        .replace("{brand_name}", fields.brand_name)
        .replace("{price}", fields.price)
}

/// Distinct placeholder tokens in order of first appearance.
pub fn placeholders(text: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    PLACEHOLDER
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|tok| seen.insert(*tok))
        .collect()
}

/// `{brand_name}` -> `Brand Name`.
pub fn humanize(token: &str) -> String {
    let bare = token.trim_start_matches('{').trim_end_matches('}');
    let mut out = String::with_capacity(bare.len());
    let mut prev_word = false;
    for ch in bare.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        let is_word = ch.is_alphanumeric();
        if is_word && !prev_word {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        prev_word = is_word;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_parses() {
        let cat = Catalog::builtin().unwrap();
        assert_eq!(cat.default_category(), "Fashion");
        assert_eq!(cat.default_ratio(), "1:1");
        assert!(!cat.templates("Fashion").is_empty());
        assert!(cat.templates("Nope").is_empty());
    }

    #[test]
    fn rejects_duplicate_template_ids() {
        let yaml = r#"
ratios: [{ id: "1:1", label: "1:1" }]
categories:
  - name: A
    templates:
      - { id: 1, en: "a", bn: "a" }
      - { id: 1, en: "b", bn: "b" }
"#;
        assert!(Catalog::from_yaml(yaml).is_err());
    }

    #[test]
    fn empty_product_and_discount_keep_tokens() {
        let body = "{product_name} now {discount} from {brand_name} at {price}";
        let out = compose(body, &PromptFields::default());
        assert_eq!(out, "{product_name} now {discount} from  at ");
    }

    #[test]
    fn fills_every_occurrence() {
        let fields = PromptFields { product_name: "Wallet", brand_name: "Artisan", price: "$29", discount: "20% OFF" };
        let out = compose("{product_name} {product_name} {brand_name} {price} {discount}", &fields);
        assert_eq!(out, "Wallet Wallet Artisan $29 20% OFF");
    }

    #[test]
    fn empty_price_substitutes_nothing() {
        let fields = PromptFields { product_name: "Wallet", ..Default::default() };
        let out = compose("Feature {product_name} at {price}", &fields);
        assert_eq!(out, "Feature Wallet at ");
        assert!(placeholders(&out).is_empty());
    }

    #[test]
    fn placeholders_are_deduplicated_in_order() {
        let found = placeholders("{discount} and {product_name} then {discount} {x1} {}");
        assert_eq!(found, vec!["{discount}", "{product_name}"]);
    }

    #[test]
    fn humanizes_tokens() {
        assert_eq!(humanize("{brand_name}"), "Brand Name");
        assert_eq!(humanize("{product_name}"), "Product Name");
        assert_eq!(humanize("{price}"), "Price");
        assert_eq!(humanize("{a__b}"), "A  B");
    }

    #[test]
    fn parses_languages() {
        assert_eq!("EN".parse::<Language>().unwrap(), Language::En);
        assert_eq!("bangla".parse::<Language>().unwrap(), Language::Bn);
        assert!("fr".parse::<Language>().is_err());
    }
}
