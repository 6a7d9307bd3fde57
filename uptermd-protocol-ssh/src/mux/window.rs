use std::collections::HashMap;

use uptermd_common::Window;
use uuid::Uuid;

/// Tracks every attachment's terminal size. The host PTY is kept at the
/// per-dimension minimum so no viewer sees wrapped output; when the last
/// attachment leaves, the PTY stays at its previous size.
#[derive(Default)]
pub struct WindowMap {
    windows: HashMap<Uuid, Window>,
}

impl WindowMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: Uuid, window: Window) {
        self.windows.insert(id, window);
    }

    pub fn remove(&mut self, id: &Uuid) {
        self.windows.remove(id);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn effective(&self) -> Option<Window> {
        let cols = self.windows.values().map(|w| w.cols).min()?;
        let rows = self.windows.values().map(|w| w.rows).min()?;
        Some(Window::new(cols, rows))
    }
}
