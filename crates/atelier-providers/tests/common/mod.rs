//! In-process provider whose outcomes are scripted per call

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use atelier_providers::{
    Billing, ChatRequest, ChatResponse, EventStream, FinishReason, ModelDescriptor, Provider,
    ProviderConfig, ProviderCore, ProviderError, ProviderKind, StreamEvent, TokenUsage,
};
use futures::stream;
use tokio::time::Instant;

pub struct ScriptedProvider {
    core: Arc<ProviderCore>,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    otherwise: Result<String, ProviderError>,
    available: bool,
    deltas: Vec<String>,
    calls: AtomicUsize,
    probes: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    /// Always succeeds, replying with its own name
    pub fn healthy(name: &str) -> Self {
        Self::with_config(ProviderConfig::new(name), Ok(format!("reply from {}", name)))
    }

    /// Fails every call with `error`
    pub fn failing(name: &str, error: ProviderError) -> Self {
        Self::with_config(ProviderConfig::new(name), Err(error))
    }

    pub fn with_config(mut config: ProviderConfig, otherwise: Result<String, ProviderError>) -> Self {
        if config.models.is_empty() {
            config.models =
                vec![ModelDescriptor::new("mock-model", "Mock Model", 1000, 100).with_pricing(0.01, 0.02)];
        }
        Self {
            core: Arc::new(ProviderCore::new(config, Billing::PerToken)),
            script: Mutex::new(VecDeque::new()),
            otherwise,
            available: true,
            deltas: Vec::new(),
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes for the first calls, before falling back to the default
    pub fn scripted(self, outcomes: Vec<Result<String, ProviderError>>) -> Self {
        *self.script.lock().unwrap() = outcomes.into();
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn streaming(mut self, deltas: &[&str]) -> Self {
        self.deltas = deltas.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

pub fn network_error(provider: &str) -> ProviderError {
    ProviderError::network(provider, "connection refused")
}

pub fn auth_error(provider: &str) -> ProviderError {
    ProviderError::Authentication {
        provider: provider.to_string(),
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn core(&self) -> &Arc<ProviderCore> {
        &self.core
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.available {
            Ok(())
        } else {
            Err(network_error(self.name()))
        }
    }

    async fn chat(&self, _request: &ChatRequest, model: &str) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        outcome.map(|content| ChatResponse {
            content,
            model: model.to_string(),
            usage: Some(TokenUsage::new(10, 5)),
            finish_reason: Some(FinishReason::Stop),
        })
    }

    async fn open_stream(&self, _request: &ChatRequest, _model: &str) -> Result<EventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = &self.otherwise {
            return Err(err.clone());
        }
        let mut events: Vec<Result<StreamEvent, ProviderError>> = self
            .deltas
            .iter()
            .map(|d| Ok(StreamEvent::Delta(d.clone())))
            .collect();
        events.push(Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some(FinishReason::Stop),
        }));
        Ok(Box::pin(stream::iter(events)))
    }
}
