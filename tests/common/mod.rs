//! Shared test helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use stagehand::clients::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use stagehand::domain::{
    EventPayload, RunCreated, RunState, RunStateChanged, WorkItemFinished, WorkItemQueued,
    WorkItemStarted,
};

/// Transport that replays a fixed script of responses and records requests.
///
/// Once the script is exhausted, `fallback` is returned for every request.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    fallback: Result<HttpResponse, TransportError>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: Ok(HttpResponse::new(200, "{}")),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answer every request with the same response
    pub fn always(response: Result<HttpResponse, TransportError>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: response,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn ok(body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(200, body))
}

pub fn status(code: u16, body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(code, body))
}

pub fn run_created() -> EventPayload {
    EventPayload::RunCreated(RunCreated {
        pipeline: Some("report".to_string()),
        metadata: Map::new(),
    })
}

pub fn run_state(new_state: RunState) -> EventPayload {
    EventPayload::RunStateChanged(RunStateChanged {
        new_state,
        old_state: None,
        reason: None,
    })
}

pub fn queued(work_item_id: &str, worker: &str) -> EventPayload {
    EventPayload::WorkItemQueued(WorkItemQueued {
        work_item_id: work_item_id.to_string(),
        worker: worker.to_string(),
        attempt: 1,
        inputs: Map::new(),
        scope_key: None,
    })
}

pub fn started(work_item_id: &str) -> EventPayload {
    EventPayload::WorkItemStarted(WorkItemStarted {
        work_item_id: work_item_id.to_string(),
        attempt: None,
    })
}

pub fn finished(work_item_id: &str, outputs: Option<Map<String, Value>>) -> EventPayload {
    EventPayload::WorkItemFinished(WorkItemFinished {
        work_item_id: work_item_id.to_string(),
        outputs,
    })
}
