mod model;

use std::time::Duration;
use async_trait::async_trait;
use futures::stream::StreamExt;
use griddle::{
    InstanceRouter, InstanceSpawner, Payload, RouterConfig, SamplingParams, ServerConfig, ServerHandle, SpawnError,
    Task, TokenId,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use crate::model::EchoModel;

static PROMPTS: [&str; 6] = [
    "the quick brown fox jumps over the lazy dog. the quick",
    "the quick brown fox jumps over the lazy dog. the lazy",
    "to be or not to be, that is the question. to be",
    "abcabcabcab",
    "hello world, hello there, hello",
    "round and round and round",
];

fn encode(text: &str) -> Vec<TokenId> {
    text.bytes().map(TokenId::from).collect()
}

fn decode(tokens: &[TokenId]) -> String {
    let bytes: Vec<u8> = tokens.iter().filter_map(|t| u8::try_from(*t).ok()).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Streams one completion and returns its text.
async fn complete(server: ServerHandle, index: usize, prompt: &str) -> griddle::Result<String> {
    let sampling = if index % 2 == 0 {
        SamplingParams::greedy()
    } else {
        SamplingParams { temperature: 0.7, seed: Some(index as u64), ..Default::default() }
    };
    let task = Task::generate(encode(prompt), 24).with_sampling(sampling).streaming();
    let task_id = server.submit(task)?;

    let mut generated = Vec::new();
    let mut results = server.stream(task_id)?;
    while let Some(result) = results.next().await {
        match result.payload {
            Payload::Token { token, .. } => generated.push(token),
            Payload::Completion { stop_reason, .. } => {
                let timings = &result.timings;
                info!(index, ?stop_reason, n_cached = timings.n_cached, generation_ms = timings.generation_ms, "completion finished");
            }
            Payload::Error(e) => warn!(index, error = %e, "completion failed"),
            other => warn!(index, ?other, "unexpected payload"),
        }
    }
    Ok(decode(&generated))
}

struct EchoSpawner;

#[async_trait]
impl InstanceSpawner for EchoSpawner {
    async fn spawn(&self, model: &str) -> Result<ServerHandle, SpawnError> {
        info!(model, "loading model");
        let config = ServerConfig { n_slots: 2, n_ctx: 1024, ..Default::default() };
        ServerHandle::spawn(EchoModel::new(), config).map_err(|e| SpawnError {
            model: model.to_string(),
            reason: e.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig {
            n_slots: 4,
            n_ctx: 2048,
            n_batch: 64,
            checkpoint_budget_bytes: 1 << 20,
            ..Default::default()
        },
    };
    let server = ServerHandle::spawn(EchoModel::new(), config)?;

    // First interrupt stops gracefully, the second forces it.
    let interrupts = {
        let server = server.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if server.shutdown() {
                    warn!("forced stop");
                    break;
                }
                info!("shutting down, interrupt again to force");
            }
        })
    };

    let handles = PROMPTS
        .iter()
        .enumerate()
        .map(|(index, prompt)| {
            let server = server.clone();
            tokio::spawn(async move { complete(server, index, prompt).await })
        })
        .collect::<Vec<_>>();

    for (prompt, handle) in PROMPTS.iter().zip(futures::future::join_all(handles).await) {
        match handle {
            Ok(Ok(text)) => println!("{prompt:?} -> {text:?}"),
            Ok(Err(e)) => warn!(error = %e, "submission failed"),
            Err(e) => error!(error = %e, "completion task panicked"),
        }
    }

    // The same prompt again now lands on a warm cache.
    let text = complete(server.clone(), 0, PROMPTS[0]).await?;
    println!("{:?} -> {text:?} (cached)", PROMPTS[0]);

    let embed = server.submit(Task::embed(encode("embed me")))?;
    let result = server.await_result(embed, Duration::from_secs(5)).await?;
    if let Payload::Embedding(vector) = result.payload {
        println!("embedding: {} dimensions", vector.len());
    }

    println!("{}", serde_json::to_string_pretty(&server.metrics())?);
    server.shutdown();
    server.join().await;

    let router = InstanceRouter::new(EchoSpawner, RouterConfig::default());
    for model in ["small", "large", "small"] {
        let (instance, task_id) = router.route(Task::generate(encode("one two one"), 8), model).await?;
        let result = instance.await_result(task_id, Duration::from_secs(5)).await?;
        info!(model, is_final = result.is_final, "routed task done");
    }
    info!(models = ?router.models(), "router state");
    router.shutdown().await;

    interrupts.abort();
    Ok(())
}
