use serde::{Deserialize, Serialize};

/// Model family a variant belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ModelFamily {
    #[strum(to_string = "CodeLlama", serialize = "codellama")]
    CodeLlama,
    #[strum(to_string = "Llama 2", serialize = "llama2")]
    Llama2,
    #[strum(to_string = "Mistral", serialize = "mistral")]
    Mistral,
}

/// Static identity and download metadata for one quantized model variant.
///
/// Hardcoded in the catalog and never changes at runtime. Identity is the
/// (family, parameter size, quantization bits) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub family: ModelFamily,
    /// Parameter count in billions
    pub parameter_size_b: u32,
    /// Weight quantization bit width
    pub quantization_bits: u32,
    /// Filename on disk (e.g., "codellama-7b-instruct.Q4_K_M.gguf")
    pub file_name: String,
    /// Direct download URL
    pub download_url: String,
    /// Expected file size; a completed download must match it exactly
    pub expected_size_bytes: Option<u64>,
    /// SHA-256 digest (hex), verified before the final rename when present
    pub sha256: Option<String>,
    /// Approximate RAM usage when loaded, in MB
    pub estimated_ram_mb: u64,
}

impl ModelDescriptor {
    /// Identity check on the (family, size, quantization) triple.
    pub fn is_variant(&self, family: ModelFamily, parameter_size_b: u32, bits: u32) -> bool {
        self.family == family
            && self.parameter_size_b == parameter_size_b
            && self.quantization_bits == bits
    }

    /// Human-readable name, e.g. "CodeLlama 7B Q4".
    pub fn display_name(&self) -> String {
        format!(
            "{} {}B Q{}",
            self.family, self.parameter_size_b, self.quantization_bits
        )
    }
}

/// All variants of one family, catalog order.
pub fn list_variants(family: ModelFamily) -> Vec<ModelDescriptor> {
    get_model_catalog()
        .into_iter()
        .filter(|d| d.family == family)
        .collect()
}

/// Look a variant up by identity.
pub fn find_variant(family: ModelFamily, parameter_size_b: u32, bits: u32) -> Option<ModelDescriptor> {
    get_model_catalog()
        .into_iter()
        .find(|d| d.is_variant(family, parameter_size_b, bits))
}

/// Whether a descriptor's identity is in the catalog.
pub fn is_in_catalog(descriptor: &ModelDescriptor) -> bool {
    find_variant(
        descriptor.family,
        descriptor.parameter_size_b,
        descriptor.quantization_bits,
    )
    .is_some()
}

/// Hardcoded catalog of GGUF model variants.
/// Sizes from the published Hugging Face repositories; upstream publishes no
/// stable per-file digests, so `sha256` is unset for catalog entries.
pub fn get_model_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            family: ModelFamily::CodeLlama,
            parameter_size_b: 7,
            quantization_bits: 4,
            file_name: "codellama-7b-instruct.Q4_K_M.gguf".into(),
            download_url:
                "https://huggingface.co/TheBloke/CodeLlama-7B-Instruct-GGUF/resolve/main/codellama-7b-instruct.Q4_K_M.gguf"
                    .into(),
            expected_size_bytes: Some(4_081_095_552), // ~3.80 GiB
            sha256: None,
            estimated_ram_mb: 6600,
        },
        ModelDescriptor {
            family: ModelFamily::CodeLlama,
            parameter_size_b: 7,
            quantization_bits: 5,
            file_name: "codellama-7b-instruct.Q5_K_M.gguf".into(),
            download_url:
                "https://huggingface.co/TheBloke/CodeLlama-7B-Instruct-GGUF/resolve/main/codellama-7b-instruct.Q5_K_M.gguf"
                    .into(),
            expected_size_bytes: Some(4_783_156_864), // ~4.45 GiB
            sha256: None,
            estimated_ram_mb: 7300,
        },
        ModelDescriptor {
            family: ModelFamily::CodeLlama,
            parameter_size_b: 13,
            quantization_bits: 4,
            file_name: "codellama-13b-instruct.Q4_K_M.gguf".into(),
            download_url:
                "https://huggingface.co/TheBloke/CodeLlama-13B-Instruct-GGUF/resolve/main/codellama-13b-instruct.Q4_K_M.gguf"
                    .into(),
            expected_size_bytes: Some(7_865_956_224), // ~7.33 GiB
            sha256: None,
            estimated_ram_mb: 10400,
        },
        ModelDescriptor {
            family: ModelFamily::CodeLlama,
            parameter_size_b: 34,
            quantization_bits: 4,
            file_name: "codellama-34b-instruct.Q4_K_M.gguf".into(),
            download_url:
                "https://huggingface.co/TheBloke/CodeLlama-34B-Instruct-GGUF/resolve/main/codellama-34b-instruct.Q4_K_M.gguf"
                    .into(),
            expected_size_bytes: Some(20_219_900_928), // ~18.8 GiB
            sha256: None,
            estimated_ram_mb: 23000,
        },
        ModelDescriptor {
            family: ModelFamily::Llama2,
            parameter_size_b: 7,
            quantization_bits: 4,
            file_name: "llama-2-7b-chat.Q4_K_M.gguf".into(),
            download_url:
                "https://huggingface.co/TheBloke/Llama-2-7B-Chat-GGUF/resolve/main/llama-2-7b-chat.Q4_K_M.gguf"
                    .into(),
            expected_size_bytes: Some(4_081_004_224), // ~3.80 GiB
            sha256: None,
            estimated_ram_mb: 6600,
        },
        ModelDescriptor {
            family: ModelFamily::Mistral,
            parameter_size_b: 7,
            quantization_bits: 4,
            file_name: "mistral-7b-instruct-v0.2.Q4_K_M.gguf".into(),
            download_url:
                "https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.2-GGUF/resolve/main/mistral-7b-instruct-v0.2.Q4_K_M.gguf"
                    .into(),
            expected_size_bytes: Some(4_368_439_584), // ~4.07 GiB
            sha256: None,
            estimated_ram_mb: 7000,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_non_empty_and_distinct() {
        let catalog = get_model_catalog();
        assert!(!catalog.is_empty());

        // Identity triples must be unique
        for (i, a) in catalog.iter().enumerate() {
            for b in catalog.iter().skip(i + 1) {
                assert!(
                    !a.is_variant(b.family, b.parameter_size_b, b.quantization_bits),
                    "duplicate variant: {}",
                    a.display_name()
                );
            }
        }

        // Every entry has a usable URL and filename
        for entry in &catalog {
            assert!(entry.download_url.starts_with("https://"));
            assert!(entry.file_name.ends_with(".gguf"));
        }
    }

    #[test]
    fn list_variants_filters_by_family() {
        let codellama = list_variants(ModelFamily::CodeLlama);
        assert!(codellama.len() >= 3);
        assert!(codellama.iter().all(|d| d.family == ModelFamily::CodeLlama));
    }

    #[test]
    fn find_variant_by_identity() {
        let found = find_variant(ModelFamily::CodeLlama, 7, 4).expect("7B Q4 exists");
        assert_eq!(found.display_name(), "CodeLlama 7B Q4");
        assert!(is_in_catalog(&found));
        assert!(find_variant(ModelFamily::Mistral, 70, 4).is_none());
    }

    #[test]
    fn family_parses_from_cli_spelling() {
        use std::str::FromStr;

        assert_eq!(ModelFamily::from_str("codellama").unwrap(), ModelFamily::CodeLlama);
        assert_eq!(ModelFamily::from_str("LLAMA2").unwrap(), ModelFamily::Llama2);
        assert!(ModelFamily::from_str("gpt4").is_err());
    }
}
