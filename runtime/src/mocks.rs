//! Mock plumbing for testing handlers without a worker or sockets.

use crate::{
    connection::{WriteHandle, WritePipeline},
    context::WorkerLocal,
};
use std::{cell::RefCell, rc::Rc};

/// A [`WriteHandle`] backed by a detached pipeline.
///
/// Writes accumulate and are observable through [`WriteHandle::depth`];
/// nothing drains them. Useful for exercising handler logic that appends
/// responses out of band.
pub fn write_handle() -> WriteHandle {
    let pipeline = Rc::new(RefCell::new(WritePipeline::new(usize::MAX, 0)));
    WriteHandle::new(0, pipeline, WorkerLocal::new())
}
