//! Expansion of a campaign config into ordered run specs.

use anyhow::Result;
use kitt_schemas::{CampaignConfig, EngineMode, EngineSpec, ErrorKind, ModelSpec};

use crate::catalog::ModelCatalog;
use crate::filter::filter_quant_names;
use crate::quant::group_gguf_files;
use crate::size::{estimate_quant_size_gb, parse_params};

/// One concrete (model, engine, quant, benchmark) combination in plan order.
#[derive(Debug, Clone)]
pub struct PlannedRunSpec {
    pub model_name: String,
    /// Repo id, Ollama tag, or local path, whatever the engine consumes.
    pub model_ref: String,
    pub engine_name: String,
    pub engine_mode: EngineMode,
    pub benchmark_name: String,
    pub suite_name: String,
    pub quant: String,
    pub include_pattern: Option<String>,
    pub estimated_size_gb: f64,
    /// Set when the run is decided at plan time (size limit): it is inserted
    /// already terminal.
    pub skip: Option<(ErrorKind, String)>,
}

impl PlannedRunSpec {
    /// The ledger uniqueness key.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.model_ref, self.engine_name, self.quant, self.benchmark_name
        )
    }
}

/// A (model, engine) pair the planner could not produce runs for. Logged on
/// the campaign stream; never a hard failure.
#[derive(Debug, Clone)]
pub struct PlanSkip {
    pub model_name: String,
    pub engine_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub runs: Vec<PlannedRunSpec>,
    pub skips: Vec<PlanSkip>,
}

/// The model format an engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFormat {
    Safetensors,
    Gguf,
    OllamaTag,
}

impl ModelFormat {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "safetensors" => Some(ModelFormat::Safetensors),
            "gguf" => Some(ModelFormat::Gguf),
            "ollama" => Some(ModelFormat::OllamaTag),
            _ => None,
        }
    }
}

/// Formats an engine consumes, preferred first. Config `formats` override;
/// otherwise built-in defaults keyed by engine name.
fn engine_formats(engine: &EngineSpec) -> Vec<ModelFormat> {
    if !engine.formats.is_empty() {
        return engine.formats.iter().filter_map(|f| ModelFormat::parse(f)).collect();
    }
    match engine.name.as_str() {
        "vllm" | "tgi" => vec![ModelFormat::Safetensors],
        "llama_cpp" | "exllamav2" => vec![ModelFormat::Gguf],
        "ollama" => vec![ModelFormat::OllamaTag],
        _ => vec![],
    }
}

fn model_ref_for(model: &ModelSpec, format: ModelFormat) -> Option<&str> {
    match format {
        ModelFormat::Safetensors => model.safetensors_repo.as_deref(),
        ModelFormat::Gguf => model.gguf_repo.as_deref(),
        ModelFormat::OllamaTag => model.ollama_tag.as_deref(),
    }
}

/// Expand a campaign config into the full ordered run list.
///
/// Deterministic for a fixed catalog: discovery output is sorted, the final
/// ordering is `(estimated_size_gb, model, engine, quant, benchmark)`
/// ascending so small models land first and disk pressure ramps gently.
pub async fn plan_campaign(
    config: &CampaignConfig,
    catalog: &dyn ModelCatalog,
) -> Result<PlanOutcome> {
    let mut outcome = PlanOutcome::default();

    let benchmarks: Vec<String> = if config.benchmarks.is_empty() {
        vec!["throughput".to_string()]
    } else {
        config.benchmarks.clone()
    };

    for model in &config.models {
        let params_b = parse_params(&model.params);

        for engine in &config.engines {
            let formats = engine_formats(engine);
            let chosen = formats
                .iter()
                .copied()
                .find(|f| model_ref_for(model, *f).is_some());

            let Some(format) = chosen else {
                outcome.skips.push(PlanSkip {
                    model_name: model.name.clone(),
                    engine_name: engine.name.clone(),
                    reason: format!(
                        "no usable model reference for engine '{}' (needs {})",
                        engine.name,
                        if formats.is_empty() { "a known format" } else { "one of its formats" }
                    ),
                });
                continue;
            };
            let model_ref = model_ref_for(model, format).unwrap_or_default().to_string();

            // One (quant, model_ref, include_pattern) tuple per variant.
            let variants: Vec<(String, String, Option<String>)> = match format {
                ModelFormat::Safetensors => {
                    // Raw safetensors carry no quant family; bf16 placeholder.
                    vec![("bf16".to_string(), model_ref.clone(), None)]
                }
                ModelFormat::Gguf => {
                    let files = catalog.list_repo_files(&model_ref).await?;
                    let quants = group_gguf_files(&files);
                    if quants.is_empty() {
                        outcome.skips.push(PlanSkip {
                            model_name: model.name.clone(),
                            engine_name: engine.name.clone(),
                            reason: format!("no GGUF files found in {model_ref}"),
                        });
                        continue;
                    }
                    let names: Vec<String> =
                        quants.iter().map(|q| q.quant_name.clone()).collect();
                    let kept = filter_quant_names(&names, &config.quant_filter);
                    quants
                        .into_iter()
                        .filter(|q| kept.contains(&q.quant_name))
                        .map(|q| {
                            (
                                q.quant_name.clone(),
                                model_ref.clone(),
                                Some(q.include_pattern),
                            )
                        })
                        .collect()
                }
                ModelFormat::OllamaTag => {
                    let tags = discover_ollama_variants(catalog, &model_ref).await;
                    let quants: Vec<String> = tags
                        .iter()
                        .map(|t| t.rsplit(':').next().unwrap_or(t).to_string())
                        .collect();
                    let kept = filter_quant_names(&quants, &config.quant_filter);
                    tags.into_iter()
                        .zip(quants)
                        .filter(|(_, q)| kept.contains(q))
                        .map(|(tag, q)| (q, tag, None))
                        .collect()
                }
            };

            for (quant, variant_ref, include_pattern) in variants {
                let mut est = estimate_quant_size_gb(params_b, &quant);
                if est <= 0.0 {
                    est = model.estimated_size_gb;
                }

                let limit = config.resource_limits.max_model_size_gb;
                let skip = if limit > 0.0 && est > limit {
                    Some((
                        ErrorKind::ResourceExceeded,
                        format!("estimated size {est:.1}GB exceeds limit of {limit:.1}GB"),
                    ))
                } else {
                    None
                };

                for benchmark in &benchmarks {
                    outcome.runs.push(PlannedRunSpec {
                        model_name: model.name.clone(),
                        model_ref: variant_ref.clone(),
                        engine_name: engine.name.clone(),
                        engine_mode: engine.mode,
                        benchmark_name: benchmark.clone(),
                        suite_name: engine.suite.clone(),
                        quant: quant.clone(),
                        include_pattern: include_pattern.clone(),
                        estimated_size_gb: est,
                        skip: skip.clone(),
                    });
                }
            }
        }
    }

    outcome.runs.sort_by(|a, b| {
        a.estimated_size_gb
            .total_cmp(&b.estimated_size_gb)
            .then_with(|| a.model_name.cmp(&b.model_name))
            .then_with(|| a.engine_name.cmp(&b.engine_name))
            .then_with(|| a.quant.cmp(&b.quant))
            .then_with(|| a.benchmark_name.cmp(&b.benchmark_name))
    });

    Ok(outcome)
}

/// Expand an Ollama base tag (`llama3.1:8b`) into the full tags to test,
/// keeping variants of the same parameter size and dropping `-text`
/// variants. Falls back to the base tag when discovery yields nothing.
async fn discover_ollama_variants(catalog: &dyn ModelCatalog, base_tag: &str) -> Vec<String> {
    let (model_name, target_size) = match base_tag.split_once(':') {
        Some((m, t)) => (m, Some(t)),
        None => (base_tag, None),
    };

    let raw = match catalog.list_ollama_tags(model_name).await {
        Ok(tags) => tags,
        Err(_) => Vec::new(),
    };

    let mut filtered: Vec<String> = raw
        .into_iter()
        .filter(|tag| match target_size {
            Some(size) if size != "latest" => tag.starts_with(size),
            _ => true,
        })
        .filter(|tag| !tag.contains("-text-") && !tag.ends_with("-text"))
        .map(|tag| format!("{model_name}:{tag}"))
        .collect();

    if filtered.is_empty() {
        return vec![base_tag.to_string()];
    }
    filtered.sort();
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use kitt_schemas::{QuantFilterConfig, ResourceLimitsConfig};

    fn base_config() -> CampaignConfig {
        serde_json::from_value(serde_json::json!({
            "name": "t",
            "models": [{
                "name": "llama3",
                "params": "8B",
                "gguf_repo": "org/llama3-gguf"
            }],
            "engines": [{"name": "llama_cpp", "suite": "quick"}],
            "benchmarks": ["throughput"]
        }))
        .unwrap()
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_repo_files(
            "org/llama3-gguf",
            &[
                "llama3-Q2_K.gguf",
                "llama3-Q4_K_M.gguf",
                "llama3-Q8_0.gguf",
            ],
        )
    }

    #[tokio::test]
    async fn skip_patterns_remove_quants() {
        let mut config = base_config();
        config.quant_filter = QuantFilterConfig {
            skip_patterns: vec!["Q2_*".to_string()],
            include_only: vec![],
        };

        let outcome = plan_campaign(&config, &catalog()).await.unwrap();
        let quants: Vec<&str> = outcome.runs.iter().map(|r| r.quant.as_str()).collect();
        assert_eq!(quants, vec!["Q4_K_M", "Q8_0"]);
        assert!(!quants.contains(&"Q2_K"));
    }

    #[tokio::test]
    async fn size_limit_marks_oversized_runs_skipped() {
        let mut config = base_config();
        config.models[0].params = "70B".to_string();
        config.resource_limits = ResourceLimitsConfig {
            max_model_size_gb: 40.0,
        };

        let outcome = plan_campaign(&config, &catalog()).await.unwrap();
        let q8 = outcome.runs.iter().find(|r| r.quant == "Q8_0").unwrap();
        let (kind, reason) = q8.skip.as_ref().unwrap();
        assert_eq!(*kind, ErrorKind::ResourceExceeded);
        assert!(reason.contains("exceeds limit"));

        // 70B * 0.35 is about 24.5GB, under the limit, so it runs normally.
        let q2 = outcome.runs.iter().find(|r| r.quant == "Q2_K").unwrap();
        assert!(q2.skip.is_none());
    }

    #[tokio::test]
    async fn zero_size_limit_disables_the_branch() {
        let mut config = base_config();
        config.models[0].params = "70B".to_string();

        let outcome = plan_campaign(&config, &catalog()).await.unwrap();
        assert!(outcome.runs.iter().all(|r| r.skip.is_none()));
    }

    #[tokio::test]
    async fn runs_are_ordered_smallest_first() {
        let outcome = plan_campaign(&base_config(), &catalog()).await.unwrap();
        let sizes: Vec<f64> = outcome.runs.iter().map(|r| r.estimated_size_gb).collect();
        let mut sorted = sizes.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sizes, sorted);
        assert_eq!(outcome.runs[0].quant, "Q2_K");
    }

    #[tokio::test]
    async fn planning_is_deterministic() {
        let config = base_config();
        let cat = catalog();
        let a = plan_campaign(&config, &cat).await.unwrap();
        let b = plan_campaign(&config, &cat).await.unwrap();
        let keys = |o: &PlanOutcome| o.runs.iter().map(|r| r.key()).collect::<Vec<_>>();
        assert_eq!(keys(&a), keys(&b));
    }

    #[tokio::test]
    async fn benchmarks_cross_product() {
        let mut config = base_config();
        config.benchmarks = vec!["throughput".to_string(), "latency".to_string()];

        let outcome = plan_campaign(&config, &catalog()).await.unwrap();
        // 3 quants × 2 benchmarks.
        assert_eq!(outcome.runs.len(), 6);
    }

    #[tokio::test]
    async fn missing_format_is_a_soft_skip() {
        let mut config = base_config();
        // vllm needs safetensors; the model only has a GGUF repo.
        config.engines.push(
            serde_json::from_value(serde_json::json!({"name": "vllm"})).unwrap(),
        );

        let outcome = plan_campaign(&config, &catalog()).await.unwrap();
        assert_eq!(outcome.skips.len(), 1);
        assert_eq!(outcome.skips[0].engine_name, "vllm");
        // llama_cpp runs still planned.
        assert_eq!(outcome.runs.len(), 3);
    }

    #[tokio::test]
    async fn ollama_discovery_filters_by_size_and_falls_back() {
        let config: CampaignConfig = serde_json::from_value(serde_json::json!({
            "name": "t",
            "models": [{"name": "llama3.1", "params": "8B", "ollama_tag": "llama3.1:8b"}],
            "engines": [{"name": "ollama", "suite": "quick"}],
            "benchmarks": ["throughput"]
        }))
        .unwrap();

        let cat = StaticCatalog::new().with_ollama_tags(
            "llama3.1",
            &["8b", "8b-instruct-q4_0", "8b-text", "70b-instruct-q4_0"],
        );
        let outcome = plan_campaign(&config, &cat).await.unwrap();
        let refs: Vec<&str> = outcome.runs.iter().map(|r| r.model_ref.as_str()).collect();
        assert!(refs.contains(&"llama3.1:8b"));
        assert!(refs.contains(&"llama3.1:8b-instruct-q4_0"));
        assert!(!refs.iter().any(|r| r.contains("70b")));
        assert!(!refs.iter().any(|r| r.ends_with("-text")));

        // Unknown model: fall back to the base tag.
        let empty = StaticCatalog::new();
        let fallback = plan_campaign(&config, &empty).await.unwrap();
        assert_eq!(fallback.runs.len(), 1);
        assert_eq!(fallback.runs[0].model_ref, "llama3.1:8b");
    }
}
