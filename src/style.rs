//! Translation style template: the per-book guidelines and fixed vocabulary preferences
//! folded into the translation engine's system prompt, and the language pair named in it.
//!
//! The teacher has no notion of "style" (it only ever moves bytes between a source site
//! and a Kindle-bound MOBI), so this is grounded on the pack's `pdftrans` prompt-assembly
//! convention: a short list of free-form instruction strings concatenated into the system
//! prompt, rather than a rigid schema, since style guidance is inherently open-ended.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StyleTemplate {
    #[serde(default = "default_language_pair")]
    pub language_pair: String,
    #[serde(default)]
    pub guidelines: Vec<String>,
    #[serde(default)]
    pub vocabulary: Vec<String>,
}

fn default_language_pair() -> String {
    "Chinese-to-Vietnamese".to_string()
}

impl Default for StyleTemplate {
    fn default() -> Self {
        StyleTemplate {
            language_pair: default_language_pair(),
            guidelines: Vec::new(),
            vocabulary: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_style_uses_chinese_to_vietnamese_pair() {
        let style = StyleTemplate::default();
        assert_eq!(style.language_pair, "Chinese-to-Vietnamese");
        assert!(style.guidelines.is_empty());
    }

    #[test]
    fn deserializes_from_toml_fragment() {
        let toml_str = r#"
            language_pair = "Chinese-to-Vietnamese"
            guidelines = ["Keep honorifics in Sino-Vietnamese form"]
            vocabulary = ["元婴 -> Nguyên Anh"]
        "#;
        let style: StyleTemplate = toml::from_str(toml_str).unwrap();
        assert_eq!(style.guidelines.len(), 1);
        assert_eq!(style.vocabulary.len(), 1);
    }
}
