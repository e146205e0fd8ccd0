use core::fmt;
use std::{
    fmt::{Display, Formatter},
    ops::Deref,
    path::PathBuf,
    str::FromStr,
};

#[allow(unused_imports)]
use log::{debug, error};
use sha3::digest;

#[derive(Clone, Debug)]
pub struct DisplayablePathBuf(pub PathBuf);

impl FromStr for DisplayablePathBuf {
    type Err = <PathBuf as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathBuf::from_str(s).map(Self)
    }
}

impl From<PathBuf> for DisplayablePathBuf {
    fn from(p: PathBuf) -> Self {
        Self(p)
    }
}

impl Display for DisplayablePathBuf {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0.display(), f)
    }
}

impl Deref for DisplayablePathBuf {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

pub trait ResultExt {
    // Log an error if it occurs, prefixed with s, otherwise return nothing.
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}

// I want to use the RustCrypto hasher types as a Hasher (i.e. on objects that
// don't actually provide bytes). I suspect the fact that this isn't
// well-supported means it's a terrible idea in general. I don't really know why
// that is, but it's certainly harmless here. So, this is an adapter for making
// a std::hash::Hasher from a digest::Digest.
pub struct DigestHasher<D: digest::Digest> {
    pub digest: D,
}

impl<D: digest::Digest> std::hash::Hasher for DigestHasher<D> {
    fn write(&mut self, bytes: &[u8]) {
        self.digest.update(bytes)
    }

    // This is required for the Hasher trait, but you shouldn't call it, it's
    // just throwing hash bits away for no reason.
    fn finish(&self) -> u64 {
        panic!("don't call this");
    }
}
