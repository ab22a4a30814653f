use std::ops::{Deref, DerefMut};

use crate::ports::Release;

/// Owns a [`Release`] resource and releases it exactly once when dropped,
/// whichever way the owning scope is left.
pub struct ReleaseGuard<R: Release> {
    inner: R,
    released: bool,
}

impl<R: Release> ReleaseGuard<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    /// Releases now instead of at drop. Later calls and the drop are no-ops.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<R: Release> Deref for ReleaseGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner
    }
}

impl<R: Release> DerefMut for ReleaseGuard<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Release> Drop for ReleaseGuard<R> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Releases each member in order, e.g. `(transport, indicator)`.
impl<A: Release, B: Release> Release for (A, B) {
    fn release(&mut self) {
        self.0.release();
        self.1.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;

    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Release for Recorder {
        fn release(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    fn recorder(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
        }
    }

    #[test]
    fn releases_on_drop() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let _guard = ReleaseGuard::new(recorder("mqtt", &log));
        }
        assert_eq!(*log.borrow(), vec!["mqtt"]);
    }

    #[test]
    fn explicit_release_happens_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut guard = ReleaseGuard::new(recorder("mqtt", &log));
            guard.release();
            guard.release();
            assert!(guard.is_released());
        }
        assert_eq!(*log.borrow(), vec!["mqtt"]);
    }

    #[test]
    fn releases_on_early_error_return() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let run = |log: &Rc<RefCell<Vec<&'static str>>>| -> Result<(), &'static str> {
            let _guard = ReleaseGuard::new((recorder("mqtt", log), recorder("led", log)));
            Err("publish failed")
        };

        assert_eq!(run(&log), Err("publish failed"));
        assert_eq!(*log.borrow(), vec!["mqtt", "led"]);
    }
}
