//! Progress callback seam.
//!
//! The transfer engine calls out through this trait and never inspects the
//! results; progress bars, GUI dialogs and terminal injection all live on
//! the other side. Per entry the engine calls `on_num` (once per
//! conversation), then `on_name`, `on_size`, repeated `on_step`, and
//! finally `on_done` after the digest (or directory creation) is confirmed.
//! `on_step` is never called before `on_size`.

pub trait TransferCallback: Send {
    fn on_num(&mut self, _num: u64) {}
    fn on_name(&mut self, _name: &str) {}
    fn on_size(&mut self, _size: u64) {}
    fn on_step(&mut self, _step: u64) {}
    fn on_done(&mut self) {}
}

/// Used when progress reporting is suppressed (quiet mode).
pub struct NoopCallback;

impl TransferCallback for NoopCallback {}

impl TransferCallback for Box<dyn TransferCallback> {
    fn on_num(&mut self, num: u64) {
        (**self).on_num(num)
    }
    fn on_name(&mut self, name: &str) {
        (**self).on_name(name)
    }
    fn on_size(&mut self, size: u64) {
        (**self).on_size(size)
    }
    fn on_step(&mut self, step: u64) {
        (**self).on_step(step)
    }
    fn on_done(&mut self) {
        (**self).on_done()
    }
}
