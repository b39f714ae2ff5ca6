//! Scripted `PsRunner` used by the scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hypertool_hyperv::powershell::{LineSink, PsOutput, PsRunner};
use hypertool_hyperv::{HyperVConfig, HyperVError, HyperVResult, HyperVService};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Reply {
    Output(PsOutput),
    Cancelled,
    /// Streams these stdout lines, then reports cancellation.
    CancelledAfter(String),
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Output(PsOutput::ok(stdout))
    }

    pub fn fail(stderr: &str) -> Self {
        Reply::Output(PsOutput::failed(1, stderr))
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// Answers each script with the first rule whose needle it contains.
/// A rule's replies are consumed in order; the last one repeats.
/// Scripts that match no rule succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, replies: Vec<Reply>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.scripts().iter().filter(|s| s.contains(needle)).count()
    }

    pub fn into_service(self) -> (Arc<ScriptedRunner>, HyperVService) {
        let runner = Arc::new(self);
        let service = HyperVService::with_runner(runner.clone(), HyperVConfig::default());
        (runner, service)
    }
}

impl ScriptedRunner {
    fn next_reply(&self, script: &str, cancel: &CancellationToken) -> HyperVResult<Reply> {
        if cancel.is_cancelled() {
            return Err(HyperVError::cancelled());
        }
        self.scripts.lock().unwrap().push(script.to_string());
        let mut rules = self.rules.lock().unwrap();
        let reply = rules
            .iter_mut()
            .find(|r| script.contains(&r.needle))
            .and_then(|r| {
                if r.replies.len() > 1 {
                    r.replies.pop_front()
                } else {
                    r.replies.front().cloned()
                }
            });
        Ok(reply.unwrap_or_else(|| Reply::ok("")))
    }
}

#[async_trait]
impl PsRunner for ScriptedRunner {
    async fn run(&self, script: &str, cancel: &CancellationToken) -> HyperVResult<PsOutput> {
        match self.next_reply(script, cancel)? {
            Reply::Output(output) => Ok(output),
            Reply::Cancelled | Reply::CancelledAfter(_) => Err(HyperVError::cancelled()),
        }
    }

    async fn run_streaming(
        &self,
        script: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> HyperVResult<PsOutput> {
        let (stdout, outcome) = match self.next_reply(script, cancel)? {
            Reply::Output(output) => (output.stdout.clone(), Ok(output)),
            Reply::Cancelled => (String::new(), Err(HyperVError::cancelled())),
            Reply::CancelledAfter(lines) => (lines, Err(HyperVError::cancelled())),
        };
        let mut kept = String::new();
        for line in stdout.lines() {
            if !on_line(line) {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        outcome.map(|mut output| {
            output.stdout = kept;
            output
        })
    }
}
