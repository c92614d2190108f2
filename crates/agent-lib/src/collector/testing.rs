//! Test doubles for the process seams

use super::{CommandOutput, CommandRunner, SpawnedStream, StreamSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;

type Script = dyn Fn(&[String]) -> CommandOutput + Send + Sync;

/// Runner answering every invocation from a closure and recording the calls
pub struct ScriptedRunner {
    script: Box<Script>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&[String]) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.calls.lock().unwrap().push(args.clone());
        Ok((self.script)(&args))
    }
}

/// Stream source handing out one in-memory pipe
pub struct PipeSource {
    reader: Mutex<Option<DuplexStream>>,
}

impl PipeSource {
    /// Returns the source and the writer end that feeds it
    pub fn new() -> (Self, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        (
            Self {
                reader: Mutex::new(Some(reader)),
            },
            writer,
        )
    }
}

impl StreamSource for PipeSource {
    fn spawn(&self) -> Result<SpawnedStream> {
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("pipe already consumed"))?;
        Ok(SpawnedStream {
            reader: Box::new(reader),
            child: None,
        })
    }
}
