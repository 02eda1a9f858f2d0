//! State shared between the joystick input and the control task.

use std::sync::atomic::{AtomicU32, Ordering};

/// Atomic wrapper for f32 values.
/// Uses AtomicU32 with bit reinterpretation.
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(val: f32) -> Self {
        Self(AtomicU32::new(val.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, val: f32, order: Ordering) {
        self.0.store(val.to_bits(), order);
    }
}

/// Relative position of one stick, each axis in `[-1, 1]`
#[derive(Debug)]
pub struct StickPosition {
    x: AtomicF32,
    y: AtomicF32,
}

impl StickPosition {
    fn new() -> Self {
        Self {
            x: AtomicF32::new(0.0),
            y: AtomicF32::new(0.0),
        }
    }

    pub fn get(&self) -> (f32, f32) {
        (self.x.load(Ordering::Acquire), self.y.load(Ordering::Acquire))
    }

    /// Non-finite values are stored as 0
    pub fn set(&self, x: f32, y: f32) {
        self.x.store(sanitize(x), Ordering::Release);
        self.y.store(sanitize(y), Ordering::Release);
    }
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Both joysticks. Written by the input widget, read by `send_control`.
#[derive(Debug)]
pub struct ControlInput {
    /// Right stick (`RJ` frames)
    pub right: StickPosition,
    /// Left stick (`LJ` frames)
    pub left: StickPosition,
}

impl ControlInput {
    pub fn new() -> Self {
        Self {
            right: StickPosition::new(),
            left: StickPosition::new(),
        }
    }

    /// Center both sticks
    pub fn center(&self) {
        self.right.set(0.0, 0.0);
        self.left.set(0.0, 0.0);
    }
}

impl Default for ControlInput {
    fn default() -> Self {
        Self::new()
    }
}
