//! Blob version set diff between a destination and its source.

use std::cmp::Ordering;

use crate::types::{BlobVersionSet, VolumeId};

/// Blobs the destination must fetch and blobs it must drop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub update_list: Vec<String>,
    pub delete_list: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.update_list.is_empty() && self.delete_list.is_empty()
    }
}

/// Single merge pass over both name-ordered sets.
///
/// The source is authoritative: a blob whose destination sequence number is
/// ahead of the source's is still updated, with a warning.
pub fn diff_blob_versions(
    volume_id: VolumeId,
    destination: &BlobVersionSet,
    source: &BlobVersionSet,
) -> DiffResult {
    let mut result = DiffResult::default();
    let mut dest_iter = destination.iter().peekable();
    let mut src_iter = source.iter().peekable();

    loop {
        match (dest_iter.peek().copied(), src_iter.peek().copied()) {
            (Some((dest_name, dest_seq)), Some((src_name, src_seq))) => {
                match dest_name.cmp(src_name) {
                    Ordering::Equal => {
                        if dest_seq != src_seq {
                            if dest_seq > src_seq {
                                tracing::warn!(
                                    volume_id,
                                    blob = %src_name,
                                    destination_seq = *dest_seq,
                                    source_seq = *src_seq,
                                    "destination blob is newer than source; overwriting"
                                );
                            }
                            result.update_list.push(src_name.clone());
                        }
                        dest_iter.next();
                        src_iter.next();
                    }
                    Ordering::Less => {
                        result.delete_list.push(dest_name.clone());
                        dest_iter.next();
                    }
                    Ordering::Greater => {
                        result.update_list.push(src_name.clone());
                        src_iter.next();
                    }
                }
            }
            (Some(_), None) => {
                result
                    .delete_list
                    .extend(dest_iter.by_ref().map(|(name, _)| name.clone()));
            }
            (None, Some(_)) => {
                result
                    .update_list
                    .extend(src_iter.by_ref().map(|(name, _)| name.clone()));
            }
            (None, None) => break,
        }
    }

    result
}
