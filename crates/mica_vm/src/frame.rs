//! Activation records.
//!
//! Frames live in one arena used as the call stack. Alongside it, one
//! stack of arena indices per function id tracks which frames of that
//! function are live, innermost last. Context variable access goes through
//! those stacks: a reference to a variable of function `f` reads the
//! innermost live frame of `f`, which is what gives nested functions
//! access to the locals of whoever called them.

use crate::value::Value;

pub(crate) struct Frame {
    pub function: u16,
    /// Offset of the next instruction to execute.
    pub ip: u32,
    /// Locals, `None` until first written. A read of an unwritten slot
    /// produces the zero of the accessing instruction's type.
    pub locals: Vec<Option<Value>>,
}

pub(crate) struct FrameStack {
    frames: Vec<Frame>,
    /// Indexed by function id; each entry is a stack of arena indices.
    active: Vec<Vec<usize>>,
}

impl FrameStack {
    pub fn new(function_count: usize) -> Self {
        FrameStack {
            frames: Vec::new(),
            active: vec![Vec::new(); function_count],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, function: u16, locals: u16) {
        let index = self.frames.len();
        self.frames.push(Frame {
            function,
            ip: 0,
            locals: vec![None; locals as usize],
        });
        self.active[function as usize].push(index);
    }

    pub fn pop(&mut self) -> bool {
        match self.frames.pop() {
            Some(frame) => {
                self.active[frame.function as usize].pop();
                !self.frames.is_empty()
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The innermost live frame of `function`, if any.
    pub fn innermost_of(&self, function: u16) -> Option<usize> {
        self.active.get(function as usize)?.last().copied()
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub fn frame_mut(&mut self, index: usize) -> &mut Frame {
        &mut self.frames[index]
    }
}
