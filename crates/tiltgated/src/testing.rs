//! Scripted frame sources and detectors for pipeline and controller tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiltgate_core::{
    DetectorError, DetectorLoader, Landmark, LandmarkDetector, LandmarkSet, Point,
};
use tiltgate_hw::{CameraError, CaptureConstraints, Frame, FrameSource, SourceProvider};

/// One scripted frame-source step.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// A frame whose face has this raw roll angle (degrees).
    Face(f32),
    NoFace,
    Dark,
    NotReady,
    CaptureFails,
    DetectorFails,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum Answer {
    Face(f32),
    NoFace,
    Fail,
}

#[derive(Default)]
pub struct Counters {
    acquire_started: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    live_sources: AtomicUsize,
    max_live_sources: AtomicUsize,
    load_started: AtomicUsize,
    loaded: AtomicUsize,
    closed: AtomicUsize,
    inferences: AtomicUsize,
    timestamps: Mutex<Vec<u64>>,
}

impl Counters {
    pub fn acquire_started(&self) -> usize {
        self.acquire_started.load(Ordering::SeqCst)
    }
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
    /// Most sources ever held at the same time.
    pub fn max_live_sources(&self) -> usize {
        self.max_live_sources.load(Ordering::SeqCst)
    }
    pub fn load_started(&self) -> usize {
        self.load_started.load(Ordering::SeqCst)
    }
    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
    pub fn inferences(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }
    pub fn timestamps(&self) -> Vec<u64> {
        self.timestamps.lock().unwrap().clone()
    }

    fn source_opened(&self) {
        let live = self.live_sources.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_sources.fetch_max(live, Ordering::SeqCst);
    }
}

/// Landmarks whose eye line sits at `degrees`.
pub fn eyes_at(degrees: f32) -> LandmarkSet {
    let (sin, cos) = degrees.to_radians().sin_cos();
    LandmarkSet::new()
        .with(Landmark::RightEyeOuter, Point::new(0.4, 0.5))
        .with(Landmark::LeftEyeOuter, Point::new(0.4 + 0.2 * cos, 0.5 + 0.2 * sin))
}

struct ScriptedSource {
    steps: VecDeque<Step>,
    answers: Arc<Mutex<VecDeque<Answer>>>,
    counters: Arc<Counters>,
    sequence: u32,
    release_delay: Duration,
    released: bool,
}

impl ScriptedSource {
    fn open(
        steps: Vec<Step>,
        answers: Arc<Mutex<VecDeque<Answer>>>,
        counters: Arc<Counters>,
        release_delay: Duration,
    ) -> Self {
        counters.source_opened();
        Self {
            steps: steps.into(),
            answers,
            counters,
            sequence: 0,
            release_delay,
            released: false,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.released {
            return Err(CameraError::SourceClosed);
        }
        let Some(step) = self.steps.pop_front() else {
            return Ok(None);
        };
        self.sequence += 1;
        let answer = match step {
            Step::NotReady => return Ok(None),
            Step::Closed => return Err(CameraError::SourceClosed),
            Step::CaptureFails => return Err(CameraError::CaptureFailed("scripted".into())),
            Step::Dark => return Ok(Some(Frame::new(vec![0; 16], 4, 4, self.sequence))),
            Step::Face(angle) => Answer::Face(angle),
            Step::NoFace => Answer::NoFace,
            Step::DetectorFails => Answer::Fail,
        };
        self.answers.lock().unwrap().push_back(answer);
        Ok(Some(Frame::new(vec![128; 16], 4, 4, self.sequence)))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            std::thread::sleep(self.release_delay);
            self.counters.live_sources.fetch_sub(1, Ordering::SeqCst);
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ScriptedDetector {
    answers: Arc<Mutex<VecDeque<Answer>>>,
    counters: Arc<Counters>,
    closed: bool,
}

impl LandmarkDetector for ScriptedDetector {
    fn infer(
        &mut self,
        _frame: &[u8],
        _width: u32,
        _height: u32,
        timestamp_ms: u64,
    ) -> Result<Option<LandmarkSet>, DetectorError> {
        self.counters.inferences.fetch_add(1, Ordering::SeqCst);
        self.counters.timestamps.lock().unwrap().push(timestamp_ms);
        match self.answers.lock().unwrap().pop_front() {
            Some(Answer::Face(angle)) => Ok(Some(eyes_at(angle))),
            Some(Answer::NoFace) | None => Ok(None),
            Some(Answer::Fail) => Err(DetectorError::InferenceFailed("scripted".into())),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A source/detector pair sharing one script.
pub fn scripted(
    steps: Vec<Step>,
    counters: Arc<Counters>,
) -> (Box<dyn FrameSource>, Box<dyn LandmarkDetector>) {
    let answers = Arc::new(Mutex::new(VecDeque::new()));
    let source = ScriptedSource::open(
        steps,
        Arc::clone(&answers),
        Arc::clone(&counters),
        Duration::ZERO,
    );
    let detector = ScriptedDetector {
        answers,
        counters,
        closed: false,
    };
    (Box::new(source), Box::new(detector))
}

/// Provider and loader backed by one script, with optional gates and failures.
pub struct MockBackend {
    steps: Vec<Step>,
    counters: Arc<Counters>,
    answers: Mutex<Option<Arc<Mutex<VecDeque<Answer>>>>>,
    camera_gate: Mutex<Option<Receiver<()>>>,
    model_gate: Mutex<Option<Receiver<()>>>,
    pub camera_denied: AtomicBool,
    pub model_missing: AtomicBool,
    /// How long each source's `release` blocks, in milliseconds.
    pub release_delay_ms: AtomicU64,
}

impl MockBackend {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps,
            counters: Arc::new(Counters::default()),
            answers: Mutex::new(None),
            camera_gate: Mutex::new(None),
            model_gate: Mutex::new(None),
            camera_denied: AtomicBool::new(false),
            model_missing: AtomicBool::new(false),
            release_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Make the next `acquire` block until the gate receives a message.
    pub fn gate_camera(&self, gate: Receiver<()>) {
        *self.camera_gate.lock().unwrap() = Some(gate);
    }

    /// Make the next `load` block until the gate receives a message.
    pub fn gate_model(&self, gate: Receiver<()>) {
        *self.model_gate.lock().unwrap() = Some(gate);
    }

    fn shared_answers(&self) -> Arc<Mutex<VecDeque<Answer>>> {
        let mut slot = self.answers.lock().unwrap();
        Arc::clone(slot.get_or_insert_with(|| Arc::new(Mutex::new(VecDeque::new()))))
    }
}

impl SourceProvider for MockBackend {
    fn acquire(&self, _constraints: &CaptureConstraints) -> Result<Box<dyn FrameSource>, CameraError> {
        self.counters.acquire_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.camera_gate.lock().unwrap().take() {
            let _ = gate.recv();
        }
        if self.camera_denied.load(Ordering::SeqCst) {
            return Err(CameraError::PermissionDenied("/dev/video0".into()));
        }
        // Each session gets a fresh answer queue.
        *self.answers.lock().unwrap() = None;
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource::open(
            self.steps.clone(),
            self.shared_answers(),
            Arc::clone(&self.counters),
            Duration::from_millis(self.release_delay_ms.load(Ordering::SeqCst)),
        )))
    }
}

impl DetectorLoader for MockBackend {
    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        self.counters.load_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.model_gate.lock().unwrap().take() {
            let _ = gate.recv();
        }
        if self.model_missing.load(Ordering::SeqCst) {
            return Err(DetectorError::ModelNotFound("det_10g.onnx".into()));
        }
        self.counters.loaded.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDetector {
            answers: self.shared_answers(),
            counters: Arc::clone(&self.counters),
            closed: false,
        }))
    }
}
