//! Engine adapter registry.
//!
//! Engines register a name, the model formats they consume, and container/
//! process builders. Adapters are looked up at dispatch time; the values
//! they build are per-command and discarded when the worker finishes. No
//! runtime import-by-string anywhere; adding an engine is a code change
//! here.

use std::collections::BTreeMap;

use kitt_schemas::CommandPayload;
use serde_json::Value;

use crate::docker::ContainerSpec;
use crate::process::ProcessSpec;

#[derive(Debug, Clone, Copy)]
pub struct EngineAdapter {
    pub name: &'static str,
    /// Model formats this engine consumes.
    pub formats: &'static [&'static str],
    pub default_image: &'static str,
    pub container_port: u16,
    pub health_path: &'static str,
    build_container: fn(&EngineAdapter, &CommandPayload, u16) -> ContainerSpec,
    build_native: Option<fn(&EngineAdapter, &CommandPayload, u16) -> ProcessSpec>,
}

impl EngineAdapter {
    /// Container spec for one command. `host_port` is where the engine's
    /// API is published on the agent.
    pub fn container_spec(&self, payload: &CommandPayload, host_port: u16) -> ContainerSpec {
        (self.build_container)(self, payload, host_port)
    }

    /// Native process spec, for engines that support `native` mode.
    pub fn native_spec(&self, payload: &CommandPayload, host_port: u16) -> Option<ProcessSpec> {
        self.build_native.map(|f| f(self, payload, host_port))
    }

    /// Image override from the engine's inline config, else the default.
    pub fn image(&self, payload: &CommandPayload) -> String {
        config_str(&payload.engine_config, "image")
            .unwrap_or(self.default_image)
            .to_string()
    }

    pub fn health_url(&self, host_port: u16) -> String {
        format!("http://127.0.0.1:{host_port}{}", self.health_path)
    }
}

fn config_str<'a>(config: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn config_u16(config: &BTreeMap<String, Value>, key: &str) -> Option<u16> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
}

/// Host port for the engine API: config override, else the adapter default.
pub fn host_port_for(adapter: &EngineAdapter, payload: &CommandPayload) -> u16 {
    config_u16(&payload.engine_config, "port").unwrap_or(adapter.container_port)
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Mount the model file or directory read-only at /models.
fn model_volume(payload: &CommandPayload) -> BTreeMap<String, String> {
    let mut volumes = BTreeMap::new();
    if payload.model_ref.starts_with('/') || payload.model_ref.starts_with("~/") {
        volumes.insert(payload.model_ref.clone(), "/models".to_string());
    }
    volumes
}

fn build_vllm(adapter: &EngineAdapter, payload: &CommandPayload, host_port: u16) -> ContainerSpec {
    let mut env = BTreeMap::new();
    if let Some(token) = config_str(&payload.engine_config, "hf_token") {
        env.insert("HUGGING_FACE_HUB_TOKEN".to_string(), token.to_string());
    }
    let model_arg = if payload.model_ref.starts_with('/') {
        "/models".to_string()
    } else {
        payload.model_ref.clone()
    };
    let mut command_args = vec!["--model".to_string(), model_arg];
    if let Some(len) = payload.engine_config.get("max_model_len").and_then(Value::as_u64) {
        command_args.push("--max-model-len".to_string());
        command_args.push(len.to_string());
    }
    ContainerSpec {
        image: adapter.image(payload),
        port: host_port,
        container_port: adapter.container_port,
        gpu: true,
        volumes: model_volume(payload),
        env,
        extra_args: vec!["--ipc=host".to_string()],
        command_args,
        name: format!("kitt-vllm-{}", short_ref(&payload.model_ref)),
        health_url: adapter.health_url(host_port),
    }
}

fn build_llama_cpp(
    adapter: &EngineAdapter,
    payload: &CommandPayload,
    host_port: u16,
) -> ContainerSpec {
    ContainerSpec {
        image: adapter.image(payload),
        port: host_port,
        container_port: adapter.container_port,
        gpu: true,
        volumes: model_volume(payload),
        env: BTreeMap::new(),
        extra_args: Vec::new(),
        command_args: vec![
            "-m".to_string(),
            "/models".to_string(),
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--port".to_string(),
            adapter.container_port.to_string(),
        ],
        name: format!("kitt-llamacpp-{}", short_ref(&payload.model_ref)),
        health_url: adapter.health_url(host_port),
    }
}

fn build_llama_cpp_native(
    adapter: &EngineAdapter,
    payload: &CommandPayload,
    host_port: u16,
) -> ProcessSpec {
    let _ = adapter;
    ProcessSpec::new("llama-server").args([
        "-m".to_string(),
        payload.model_ref.clone(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        host_port.to_string(),
    ])
}

fn build_ollama(adapter: &EngineAdapter, payload: &CommandPayload, host_port: u16) -> ContainerSpec {
    // Ollama pulls the model inside the container; no volume needed.
    ContainerSpec {
        image: adapter.image(payload),
        port: host_port,
        container_port: adapter.container_port,
        gpu: true,
        volumes: BTreeMap::new(),
        env: BTreeMap::new(),
        extra_args: Vec::new(),
        command_args: Vec::new(),
        name: format!("kitt-ollama-{}", short_ref(&payload.model_ref)),
        health_url: adapter.health_url(host_port),
    }
}

fn build_ollama_native(
    adapter: &EngineAdapter,
    _payload: &CommandPayload,
    host_port: u16,
) -> ProcessSpec {
    let _ = adapter;
    ProcessSpec::new("ollama")
        .arg("serve")
        .env_var("OLLAMA_HOST", format!("127.0.0.1:{host_port}"))
}

fn build_tgi(adapter: &EngineAdapter, payload: &CommandPayload, host_port: u16) -> ContainerSpec {
    let mut env = BTreeMap::new();
    if let Some(token) = config_str(&payload.engine_config, "hf_token") {
        env.insert("HF_TOKEN".to_string(), token.to_string());
    }
    ContainerSpec {
        image: adapter.image(payload),
        port: host_port,
        container_port: adapter.container_port,
        gpu: true,
        volumes: model_volume(payload),
        env,
        extra_args: vec!["--shm-size".to_string(), "1g".to_string()],
        command_args: vec!["--model-id".to_string(), payload.model_ref.clone()],
        name: format!("kitt-tgi-{}", short_ref(&payload.model_ref)),
        health_url: adapter.health_url(host_port),
    }
}

fn short_ref(model_ref: &str) -> String {
    model_ref
        .rsplit('/')
        .next()
        .unwrap_or(model_ref)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(24)
        .collect()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const ADAPTERS: &[EngineAdapter] = &[
    EngineAdapter {
        name: "vllm",
        formats: &["safetensors"],
        default_image: "vllm/vllm-openai:latest",
        container_port: 8000,
        health_path: "/health",
        build_container: build_vllm,
        build_native: None,
    },
    EngineAdapter {
        name: "llama_cpp",
        formats: &["gguf"],
        default_image: "ghcr.io/ggerganov/llama.cpp:server-cuda",
        container_port: 8081,
        health_path: "/health",
        build_container: build_llama_cpp,
        build_native: Some(build_llama_cpp_native),
    },
    EngineAdapter {
        name: "ollama",
        formats: &["ollama"],
        default_image: "ollama/ollama:latest",
        container_port: 11434,
        health_path: "/api/tags",
        build_container: build_ollama,
        build_native: Some(build_ollama_native),
    },
    EngineAdapter {
        name: "tgi",
        formats: &["safetensors"],
        default_image: "ghcr.io/huggingface/text-generation-inference:latest",
        container_port: 80,
        health_path: "/health",
        build_container: build_tgi,
        build_native: None,
    },
];

/// Look up an engine adapter by name.
pub fn get(name: &str) -> Option<&'static EngineAdapter> {
    ADAPTERS.iter().find(|a| a.name == name)
}
