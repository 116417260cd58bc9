#![macro_use]

/// Define a transparent wrapper around a non-null libibverbs object pointer.
///
/// The wrapper dereferences to the `NonNull` pointer and is `Send + Sync`:
/// libibverbs objects may be used from any thread.
macro_rules! ibv_handle {
    ($(#[$meta:meta])* $vis:vis struct $wrapper_ty:ident($ibv_ty:ty);) => {
        $(#[$meta])*
        #[repr(transparent)]
        $vis struct $wrapper_ty(::std::ptr::NonNull<$ibv_ty>);

        impl $wrapper_ty {
            /// Wrap a pointer returned by a verb, mapping null to the last OS error.
            #[inline]
            #[allow(dead_code)]
            pub(crate) fn from_raw(ptr: *mut $ibv_ty) -> ::std::io::Result<Self> {
                ::std::ptr::NonNull::new(ptr)
                    .map(Self)
                    .ok_or_else(::std::io::Error::last_os_error)
            }

            #[inline]
            pub(crate) fn as_raw(&self) -> *mut $ibv_ty {
                self.0.as_ptr()
            }
        }

        impl ::std::ops::Deref for $wrapper_ty {
            type Target = ::std::ptr::NonNull<$ibv_ty>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<::std::ptr::NonNull<$ibv_ty>> for $wrapper_ty {
            fn from(pointer: ::std::ptr::NonNull<$ibv_ty>) -> Self {
                Self(pointer)
            }
        }

        impl ::std::fmt::Debug for $wrapper_ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_tuple(stringify!($wrapper_ty)).field(&self.0).finish()
            }
        }

        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}
