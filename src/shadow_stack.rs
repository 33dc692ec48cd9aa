use crate::gc_info_table::FrameId;

/// One activation record. Which slots hold pointers is described by the
/// stack map registered for `id`.
pub struct Frame {
    pub id: FrameId,
    pub slots: Box<[usize]>,
}

/// Shadow stack of a mutator: the precise frames the stack scanner walks.
pub struct ShadowStack {
    frames: Vec<Frame>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, id: FrameId, slots: usize) -> usize {
        self.frames.push(Frame {
            id,
            slots: vec![0; slots].into_boxed_slice(),
        });
        self.frames.len() - 1
    }

    /// Pop every frame at or above `depth`.
    pub fn pop_to(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn frame(&self, depth: usize) -> &Frame {
        &self.frames[depth]
    }

    #[inline]
    pub fn frame_mut(&mut self, depth: usize) -> &mut Frame {
        &mut self.frames[depth]
    }

    /// Walk frames from the innermost one out.
    pub fn walk(&self, mut visitor: impl FnMut(usize, &Frame)) {
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            visitor(depth, frame);
        }
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}
