//! Scripted in-memory engine and output capture used by the unit tests.

use crate::transcription::engine::{ContextParams, InferenceContext, InferenceEngine, InferenceParams, Segment};
use anyhow::{anyhow, Result};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Model paths containing this marker fail to load.
pub const MISSING_MODEL: &str = "missing";

/// In-memory writer that can be cloned and inspected while a worker writes to it.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Shared behaviour and counters behind a [`ScriptedEngine`].
#[derive(Default)]
pub struct Script {
    pub segments: Vec<Segment>,
    pub delay: Duration,
    pub fail_runs: bool,
    pub panic_runs: bool,
    pub multilingual: bool,
    pub loads: AtomicUsize,
    pub drops: AtomicUsize,
    pub runs: Mutex<Vec<(InferenceParams, usize)>>,
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(mut self, f: impl FnOnce(&mut Script)) -> Self {
        let script = Arc::get_mut(&mut self.script).expect("script edited after sharing");
        f(script);
        self
    }

    pub fn with_segments(self, segments: Vec<Segment>) -> Self {
        self.edit(|s| s.segments = segments)
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.delay = delay)
    }

    pub fn failing_runs(self) -> Self {
        self.edit(|s| s.fail_runs = true)
    }

    pub fn panicking_runs(self) -> Self {
        self.edit(|s| s.panic_runs = true)
    }

    pub fn multilingual(self) -> Self {
        self.edit(|s| s.multilingual = true)
    }

    pub fn script(&self) -> Arc<Script> {
        Arc::clone(&self.script)
    }
}

impl InferenceEngine for ScriptedEngine {
    type Context = ScriptedContext;

    fn load_context(&self, model_path: &str, _params: &ContextParams) -> Result<ScriptedContext> {
        if model_path.contains(MISSING_MODEL) {
            return Err(anyhow!("failed to open {}", model_path));
        }
        self.script.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            script: Arc::clone(&self.script),
            segments: Vec::new(),
            timing_resets: 0,
        })
    }
}

pub struct ScriptedContext {
    script: Arc<Script>,
    segments: Vec<Segment>,
    pub timing_resets: usize,
}

impl InferenceContext for ScriptedContext {
    fn is_multilingual(&self) -> bool {
        self.script.multilingual
    }

    fn reset_timings(&mut self) {
        self.timing_resets += 1;
    }

    fn run(&mut self, params: &InferenceParams, samples: &[f32]) -> Result<()> {
        std::thread::sleep(self.script.delay);
        self.script.runs.lock().unwrap().push((params.clone(), samples.len()));
        self.segments.clear();

        if self.script.panic_runs {
            panic!("scripted engine panic");
        }
        if self.script.fail_runs {
            return Err(anyhow!("scripted inference failure"));
        }
        self.segments = self.script.segments.clone();
        Ok(())
    }

    fn n_segments(&self) -> usize {
        self.segments.len()
    }

    fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.script.drops.fetch_add(1, Ordering::SeqCst);
    }
}
