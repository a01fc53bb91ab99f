#![macro_use]

//! Logging shim.
//!
//! Routes the crate's log statements to `defmt` (feature `defmt-log`) or
//! the `log` crate (feature `log`). With neither feature enabled every
//! statement compiles to nothing.

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("the `defmt-log` and `log` features are mutually exclusive");

macro_rules! trace {
    ($($x:expr),* $(,)?) => {{
        #[cfg(feature = "defmt-log")]
        ::defmt::trace!($($x),*);
        #[cfg(feature = "log")]
        ::log::trace!($($x),*);
        #[cfg(not(any(feature = "defmt-log", feature = "log")))]
        let _ = ($(&$x),*);
    }};
}

macro_rules! debug {
    ($($x:expr),* $(,)?) => {{
        #[cfg(feature = "defmt-log")]
        ::defmt::debug!($($x),*);
        #[cfg(feature = "log")]
        ::log::debug!($($x),*);
        #[cfg(not(any(feature = "defmt-log", feature = "log")))]
        let _ = ($(&$x),*);
    }};
}

macro_rules! info {
    ($($x:expr),* $(,)?) => {{
        #[cfg(feature = "defmt-log")]
        ::defmt::info!($($x),*);
        #[cfg(feature = "log")]
        ::log::info!($($x),*);
        #[cfg(not(any(feature = "defmt-log", feature = "log")))]
        let _ = ($(&$x),*);
    }};
}

macro_rules! warn {
    ($($x:expr),* $(,)?) => {{
        #[cfg(feature = "defmt-log")]
        ::defmt::warn!($($x),*);
        #[cfg(feature = "log")]
        ::log::warn!($($x),*);
        #[cfg(not(any(feature = "defmt-log", feature = "log")))]
        let _ = ($(&$x),*);
    }};
}

macro_rules! error {
    ($($x:expr),* $(,)?) => {{
        #[cfg(feature = "defmt-log")]
        ::defmt::error!($($x),*);
        #[cfg(feature = "log")]
        ::log::error!($($x),*);
        #[cfg(not(any(feature = "defmt-log", feature = "log")))]
        let _ = ($(&$x),*);
    }};
}
