/// Runs a closure when dropped.
///
/// Worker threads lean on this for their shutdown trace: it fires on every
/// exit path out of the event loop, panics included.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken out on drop; an FnOnce can only be called by value.
    on_exit: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_exit: F) -> Self {
        Self {
            on_exit: Some(on_exit),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit();
        }
    }
}
