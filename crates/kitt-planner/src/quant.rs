//! GGUF quantisation discovery helpers: quant-name extraction from file
//! names and grouping of multi-shard files into one logical quant.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

/// Matches all common GGUF quantisation names:
/// Q2_K through Q8_0, IQ1_S through IQ4_XS, FP16, BF16, F32.
fn quant_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(IQ[1-4]_[A-Za-z]+|[Qq][2-8]_[Kk0](?:_[SMLsml])?|[Ff][Pp]16|[Bb][Ff]16|[Ff]32)")
            .expect("quant regex is valid")
    })
}

/// Shard file suffix: `-00001-of-00002.gguf`.
fn shard_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-(\d{5})-of-(\d{5})\.gguf$").expect("shard regex is valid"))
}

/// One discovered quantisation variant and the files that make it up.
#[derive(Debug, Clone, PartialEq)]
pub struct GgufQuantInfo {
    pub quant_name: String,
    /// Sorted repo-relative paths; more than one entry means sharded.
    pub files: Vec<String>,
    /// Download include pattern covering every shard.
    pub include_pattern: String,
}

impl GgufQuantInfo {
    pub fn is_sharded(&self) -> bool {
        self.files.len() > 1
    }

    /// First file (or first shard) for loading.
    pub fn primary_file(&self) -> &str {
        self.files.first().map(String::as_str).unwrap_or("")
    }
}

/// Extract the quantisation name from a GGUF filename.
///
/// Operates on the filename part only, never directory components. The
/// `.gguf` extension is stripped explicitly rather than via a generic stem
/// split, which misfires on dotted names like `Llama-3.3-70B-Q4_K_M`.
pub fn extract_quant_name(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    let name = if name.len() >= 5 && name[name.len() - 5..].eq_ignore_ascii_case(".gguf") {
        &name[..name.len() - 5]
    } else {
        name
    };
    match quant_pattern().find(name) {
        Some(m) => m.as_str().to_string(),
        None => name.to_string(),
    }
}

/// Group a repo's GGUF files by quant, collapsing shards into one entry and
/// building a download include pattern per variant.
pub fn group_gguf_files(paths: &[String]) -> Vec<GgufQuantInfo> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for path in paths {
        if !path.ends_with(".gguf") {
            continue;
        }
        let filename = path.rsplit('/').next().unwrap_or(path);
        let quant_name = if shard_pattern().is_match(filename) {
            let base = shard_pattern().replace(filename, "");
            extract_quant_name(&base)
        } else {
            extract_quant_name(filename)
        };
        groups.entry(quant_name).or_default().push(path.clone());
    }

    groups
        .into_iter()
        .map(|(quant_name, mut files)| {
            files.sort();
            let include_pattern = if files.len() == 1 {
                files[0].clone()
            } else {
                match files[0].rsplit_once('/') {
                    Some((dir, _)) => format!("{dir}/*.gguf"),
                    None => format!("{}*.gguf", common_prefix(&files)),
                }
            };
            GgufQuantInfo {
                quant_name,
                files,
                include_pattern,
            }
        })
        .collect()
}

/// Longest common prefix of a list of strings.
fn common_prefix(strings: &[String]) -> String {
    let Some(first) = strings.first() else {
        return String::new();
    };
    let mut prefix = first.clone();
    for s in &strings[1..] {
        while !s.starts_with(&prefix) {
            prefix.pop();
            if prefix.is_empty() {
                return prefix;
            }
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_common_quant_names() {
        assert_eq!(
            extract_quant_name("Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf"),
            "Q4_K_M"
        );
        assert_eq!(extract_quant_name("qwen2.5-7b-instruct-q4_k_m.gguf"), "q4_k_m");
        assert_eq!(extract_quant_name("model-IQ4_XS.gguf"), "IQ4_XS");
        assert_eq!(extract_quant_name("model-IQ3_M.gguf"), "IQ3_M");
        assert_eq!(extract_quant_name("model-BF16.gguf"), "BF16");
    }

    #[test]
    fn dotted_model_names_do_not_confuse_extension_handling() {
        assert_eq!(extract_quant_name("Llama-3.3-70B-Q4_K_M.gguf"), "Q4_K_M");
    }

    #[test]
    fn quant_comes_from_filename_not_directory() {
        assert_eq!(
            extract_quant_name("Q8_0-dir/model-Q2_K.gguf"),
            "Q2_K"
        );
    }

    #[test]
    fn unmatched_name_falls_back_to_stem() {
        assert_eq!(extract_quant_name("weird-model.gguf"), "weird-model");
    }

    #[test]
    fn shards_group_into_one_logical_quant() {
        let files = vec![
            "sub/model-Q6_K-00001-of-00002.gguf".to_string(),
            "sub/model-Q6_K-00002-of-00002.gguf".to_string(),
            "model-Q2_K.gguf".to_string(),
        ];
        let quants = group_gguf_files(&files);
        assert_eq!(quants.len(), 2);

        let q6 = quants.iter().find(|q| q.quant_name == "Q6_K").unwrap();
        assert!(q6.is_sharded());
        assert_eq!(q6.include_pattern, "sub/*.gguf");

        let q2 = quants.iter().find(|q| q.quant_name == "Q2_K").unwrap();
        assert!(!q2.is_sharded());
        assert_eq!(q2.include_pattern, "model-Q2_K.gguf");
    }

    #[test]
    fn non_gguf_files_are_ignored() {
        let files = vec![
            "README.md".to_string(),
            "model-Q4_K_M.gguf".to_string(),
        ];
        let quants = group_gguf_files(&files);
        assert_eq!(quants.len(), 1);
        assert_eq!(quants[0].quant_name, "Q4_K_M");
    }
}
