use btg_types::Header;

use crate::error::Error;

/// Header access for the retarget functions: an in-flight cache layered over
/// whatever the chain has on disk, so a chunk can be verified before any of
/// it is written.
pub trait HeaderLookup {
    fn header_at(&self, height: u64) -> Result<Option<Header>, Error>;
}

pub(crate) fn require_header(lookup: &impl HeaderLookup, height: u64) -> Result<Header, Error> {
    lookup
        .header_at(height)?
        .ok_or(Error::MissingHeader(height))
}
