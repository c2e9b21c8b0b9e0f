use serde::{Deserialize, Serialize};

/// Per-participant source selection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Not in the channel; the track still streams silence
    Absent,
    /// In the channel, sink fed by the silence generator
    PresentSilent,
    /// In the channel, sink fed by decoded live voice
    PresentSpeaking,
}

/// Interval relative to session start; open while `end_ms` is None
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start_ms: u64,
    pub end_ms: Option<u64>,
}

impl Window {
    pub fn open(start_ms: u64) -> Self {
        Self { start_ms, end_ms: None }
    }

    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }
}

/// Sequence of non-overlapping windows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    windows: Vec<Window>,
}

impl Timeline {
    /// Open a window unless one is already open
    pub fn begin(&mut self, at_ms: u64) -> bool {
        if self.is_open() {
            return false;
        }
        self.windows.push(Window::open(at_ms));
        true
    }

    /// Close the open window, if any
    pub fn end(&mut self, at_ms: u64) -> bool {
        match self.windows.last_mut() {
            Some(window) if window.is_open() => {
                window.end_ms = Some(at_ms.max(window.start_ms));
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.windows.last().is_some_and(Window::is_open)
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn into_windows(self) -> Vec<Window> {
        self.windows
    }
}
