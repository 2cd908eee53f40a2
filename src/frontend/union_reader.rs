//! Concatenates an in-image directory's own listing with the listings of its recorded runtime
//! union partners (§4.4's "union reader"). Entries are not de-duplicated, per spec — a name
//! shadowed by a runtime union is still visible twice if both sides offer it.

use std::ffi::OsString;

use crate::error::{Error, Result};
use crate::frontend::dircache::CachedChild;
use crate::frontend::Frontend;
use crate::inode;

impl Frontend {
    /// Builds the union-readdir listing for the in-image directory at external inode
    /// `dir_external`, consulting (and populating) the per-image dircache.
    ///
    /// `dir_external`'s own listing comes first, followed by each union partner's listing for
    /// the *same relative directory* (the partner inode recorded at scan time already denotes
    /// the corresponding subtree root — see
    /// [`crate::namespace::Namespace::scan_package`]), in recording order.
    pub(crate) fn union_readdir(&self, dir_external: u64) -> Result<Vec<(OsString, CachedChild)>> {
        let (image_index, cache_key) = match inode::decode(dir_external) {
            inode::Decoded::Image {
                image_index,
                internal,
            } => (image_index, internal),
            _ => {
                return Err(Error::InvalidArgument(
                    "union_readdir called on a non-image inode".into(),
                ))
            }
        };

        if let Some(cached) = self.dircache_for(image_index).get(cache_key) {
            return Ok(cached);
        }

        let image = self.ensure_open(image_index)?;
        let internal = self.substitute_root(&image, cache_key);
        let mut listing: Vec<(OsString, CachedChild)> = image
            .readdir(internal)?
            .into_iter()
            .map(|(name, child, file_type)| {
                (
                    name,
                    CachedChild {
                        inode: inode::encode(Some(image_index), child),
                        file_type,
                    },
                )
            })
            .collect();

        for partner_external in self.namespace.unions_of(dir_external) {
            let (partner_image_index, partner_internal) = match inode::decode(partner_external) {
                inode::Decoded::Image {
                    image_index,
                    internal,
                } => (image_index, internal),
                _ => continue,
            };
            let partner_image = self.ensure_open(partner_image_index)?;
            let partner_internal = self.substitute_root(&partner_image, partner_internal);
            if let Ok(entries) = partner_image.readdir(partner_internal) {
                listing.extend(entries.into_iter().map(|(name, child, file_type)| {
                    (
                        name,
                        CachedChild {
                            inode: inode::encode(Some(partner_image_index), child),
                            file_type,
                        },
                    )
                }));
            }
        }

        self.dircache_for(image_index).put(cache_key, listing.clone());
        Ok(listing)
    }
}
