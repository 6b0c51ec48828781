use super::error::Result;
use super::ir::Module;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UnitHandle(u64);

impl UnitHandle {
    pub(crate) fn new(id: u64) -> Self {
        UnitHandle(id)
    }
}

/// What the session needs from whatever turns finished units into running
/// code.
///
/// Declarations in a submitted unit must link against definitions from
/// units submitted earlier; the newest definition of a name wins.
pub(crate) trait Backend {
    type Symbol;

    fn submit(&mut self, unit: Module) -> Result<UnitHandle>;

    fn lookup_symbol(&mut self, name: &str) -> Option<Self::Symbol>;

    /// Calls a zero-argument function found with `lookup_symbol`.
    fn invoke(&mut self, symbol: &Self::Symbol) -> Result<f64>;

    fn release(&mut self, handle: UnitHandle) -> Result<()>;
}

/// A submitted unit that is handed back to the backend when dropped.
pub(crate) struct Submitted<'a, B: Backend> {
    backend: &'a mut B,
    handle: Option<UnitHandle>,
}

impl<'a, B: Backend> Submitted<'a, B> {
    pub(crate) fn new(backend: &'a mut B, unit: Module) -> Result<Self> {
        let handle = backend.submit(unit)?;
        Ok(Submitted {
            backend,
            handle: Some(handle),
        })
    }

    pub(crate) fn backend(&mut self) -> &mut B {
        &mut *self.backend
    }

    /// Releases now, reporting the outcome instead of only logging it.
    pub(crate) fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.backend.release(handle),
            None => Ok(()),
        }
    }
}

impl<'a, B: Backend> Drop for Submitted<'a, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.backend.release(handle) {
                error!(error = %e, ?handle, "failed to release unit");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::error::Error;
    use super::*;

    #[derive(Default)]
    struct Recorder {
        submitted: u64,
        released: Vec<UnitHandle>,
    }

    impl Backend for Recorder {
        type Symbol = ();

        fn submit(&mut self, _unit: Module) -> Result<UnitHandle> {
            self.submitted += 1;
            Ok(UnitHandle::new(self.submitted))
        }

        fn lookup_symbol(&mut self, _name: &str) -> Option<()> {
            Some(())
        }

        fn invoke(&mut self, _symbol: &()) -> Result<f64> {
            Err(Error::backend("boom"))
        }

        fn release(&mut self, handle: UnitHandle) -> Result<()> {
            self.released.push(handle);
            Ok(())
        }
    }

    fn call(guard: &mut Submitted<Recorder>) -> Result<f64> {
        let sym = guard.backend().lookup_symbol("f").unwrap();
        guard.backend().invoke(&sym)
    }

    #[test]
    fn test_drop_releases_after_failed_call() {
        let mut backend = Recorder::default();
        {
            let mut guard = Submitted::new(&mut backend, Module::new("m")).unwrap();
            assert!(call(&mut guard).is_err());
        }
        assert_eq!(backend.released, vec![UnitHandle::new(1)]);
    }

    #[test]
    fn test_explicit_release_happens_once() {
        let mut backend = Recorder::default();
        let guard = Submitted::new(&mut backend, Module::new("m")).unwrap();
        guard.release().unwrap();
        assert_eq!(backend.released, vec![UnitHandle::new(1)]);
    }
}
