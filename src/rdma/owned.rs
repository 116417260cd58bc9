//! Scoped ownership of provider resources.

use std::fmt;
use std::io;
use std::ops::Deref;

use super::provider::Provider;

/// Releases a provider resource.
pub(crate) type Releaser<P, R> = fn(&P, R) -> io::Result<()>;

/// Owns one provider resource and releases it exactly once.
///
/// Dropping releases implicitly and can only log a failure;
/// [`Owned::release`] does the same but reports it.
pub(crate) struct Owned<P: Provider, R> {
    provider: P,
    res: Option<R>,
    release: Releaser<P, R>,
    what: &'static str,
}

impl<P: Provider, R> Owned<P, R> {
    pub fn new(provider: &P, res: R, release: Releaser<P, R>, what: &'static str) -> Self {
        log::debug!("acquired {}", what);
        Self {
            provider: provider.clone(),
            res: Some(res),
            release,
            what,
        }
    }

    /// What this resource is, for diagnostics.
    #[inline]
    pub fn what(&self) -> &'static str {
        self.what
    }

    /// Release now. On failure the resource is considered leaked.
    pub fn release(mut self) -> io::Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> io::Result<()> {
        match self.res.take() {
            Some(res) => {
                let ret = (self.release)(&self.provider, res);
                if ret.is_ok() {
                    log::debug!("released {}", self.what);
                }
                ret
            }
            None => Ok(()),
        }
    }
}

impl<P: Provider, R> Deref for Owned<P, R> {
    type Target = R;

    fn deref(&self) -> &R {
        match &self.res {
            Some(res) => res,
            // `res` is only taken by `release_inner`, which is reached from
            // `release(self)` and `drop`, after which no deref can happen.
            None => unreachable!("resource {} used after release", self.what),
        }
    }
}

impl<P: Provider, R> Drop for Owned<P, R> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::error!("cannot release {} on drop: {}", self.what, e);
        }
    }
}

impl<P: Provider, R> fmt::Debug for Owned<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("what", &self.what)
            .field("live", &self.res.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::{SoftDevice, SoftFabric, Verb};

    fn fabric() -> SoftFabric {
        SoftFabric::new().with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()))
    }

    #[test]
    fn test_drop_releases() {
        let f = fabric();
        {
            let ctx = f.open_device("soft0").unwrap();
            let _ctx = Owned::new(&f, ctx, SoftFabric::close_device, "device context");
            assert_eq!(f.live().contexts, 1);
        }
        assert!(f.live().is_empty());
    }

    #[test]
    fn test_release_reports_failure() {
        let f = fabric();
        let ctx = f.open_device("soft0").unwrap();
        let ctx = Owned::new(&f, ctx, SoftFabric::close_device, "device context");
        f.fail_next(Verb::CloseDevice, libc::EIO);
        assert_eq!(ctx.release().unwrap_err().raw_os_error(), Some(libc::EIO));
        // Leaked, not retried on drop.
        assert_eq!(f.live().contexts, 1);
    }
}
