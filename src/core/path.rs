//! Path tracking for hops.
//!
//! A hop locates itself on the connection path when a call enters its chain and
//! rewinds the index before handing the result back upstream. Only requests append;
//! close calls locate the hop on the existing path and leave it untouched.

use uuid::Uuid;

use crate::credentials::HopToken;
use crate::protocols::{Path, PathSegment};

/// Where a hop sits on a path for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPosition {
    pub name: String,
    pub segment_id: String,
    /// Index of this hop's segment.
    pub index: usize,
    /// Index the caller handed in, restored by [`leave`].
    pub caller_index: usize,
}

/// Locate or append this hop's segment for a request.
///
/// - empty path: append the first segment
/// - current segment already ours: refresh its token (re-request from the caller)
/// - next segment already ours: advance and refresh its token (re-request through us)
/// - otherwise: advance, drop any stale tail left by an earlier route, append
pub fn enter_request(path: &mut Path, name: &str, token: HopToken) -> HopPosition {
    let caller_index = path.index as usize;

    if path.path_segments.is_empty() {
        let segment = new_segment(name, token);
        let segment_id = segment.id.clone();
        path.path_segments.push(segment);
        path.index = 0;
        return HopPosition {
            name: name.to_string(),
            segment_id,
            index: 0,
            caller_index: 0,
        };
    }

    if let Some(segment) = path.path_segments.get_mut(caller_index) {
        if segment.name == name {
            refresh(segment, token);
            return HopPosition {
                name: name.to_string(),
                segment_id: segment.id.clone(),
                index: caller_index,
                caller_index,
            };
        }
    }

    let index = caller_index + 1;
    path.index = index as u32;
    if let Some(segment) = path.path_segments.get_mut(index) {
        if segment.name == name {
            refresh(segment, token);
            return HopPosition {
                name: name.to_string(),
                segment_id: segment.id.clone(),
                index,
                caller_index,
            };
        }
    }

    path.path_segments.truncate(index);
    let segment = new_segment(name, token);
    let segment_id = segment.id.clone();
    path.path_segments.push(segment);

    HopPosition {
        name: name.to_string(),
        segment_id,
        index,
        caller_index,
    }
}

/// Locate this hop's segment for a close. Returns `None` when the hop is not on the
/// path, in which case nothing was ever established through it.
pub fn enter_close(path: &mut Path, name: &str) -> Option<HopPosition> {
    let caller_index = path.index as usize;
    let found = [caller_index, caller_index + 1]
        .into_iter()
        .find(|&index| {
            path.path_segments
                .get(index)
                .is_some_and(|segment| segment.name == name)
        })?;

    path.index = found as u32;
    Some(HopPosition {
        name: name.to_string(),
        segment_id: path.path_segments[found].id.clone(),
        index: found,
        caller_index,
    })
}

/// Restore the index the caller handed in.
pub fn leave(path: &mut Path, position: &HopPosition) {
    path.index = position.caller_index as u32;
}

fn new_segment(name: &str, token: HopToken) -> PathSegment {
    PathSegment {
        name: name.to_string(),
        id: Uuid::new_v4().to_string(),
        token: token.token,
        expires: token.expires,
    }
}

fn refresh(segment: &mut PathSegment, token: HopToken) {
    segment.token = token.token;
    segment.expires = token.expires;
}
