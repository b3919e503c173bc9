//! Backup-side reconciliation: which remote contents are missing locally.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::content::algebra::remove;
use crate::content::content_data::ContentData;
use crate::content::dynamic::DynamicContentData;
use crate::copy::client::CopyClient;
use crate::copy::manager::len_as_i64;
use crate::core::errors::{MirrorError, Result};
use crate::daemon::context::{ProcessContext, vars};

const SLEEP_STEP: Duration = Duration::from_millis(200);

/// Remote contents whose checksum is absent from `local`, or `None` when
/// nothing needs copying.
pub fn compare(local: &ContentData, remote: &ContentData) -> Option<ContentData> {
    remove(Some(local), Some(remote)).filter(|diff| diff.contents_size() > 0)
}

/// Compare the two live indices every `interval` and request copies for the
/// difference. Work missed earlier is re-derived on the next pass.
pub fn spawn_comparator(
    local: Arc<DynamicContentData>,
    remote: Arc<DynamicContentData>,
    client: CopyClient,
    interval: Duration,
    ctx: ProcessContext,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("cmir-comparator".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let local_now = local.snapshot();
                let remote_now = remote.snapshot();
                ctx.vars.set(vars::LOCAL_CONTENTS, len_as_i64(local_now.contents_size()));
                ctx.vars.set(vars::REMOTE_CONTENTS, len_as_i64(remote_now.contents_size()));
                match compare(&local_now, &remote_now) {
                    Some(diff) => {
                        info!(missing = diff.contents_size(), "backup is behind; requesting copy");
                        client.request_copy(diff);
                    }
                    None => debug!("backup is up to date"),
                }
                let mut left = interval;
                while !left.is_zero() && !shutdown.load(Ordering::Relaxed) {
                    let step = left.min(SLEEP_STEP);
                    thread::sleep(step);
                    left -= step;
                }
            }
        })
        .map_err(|e| MirrorError::Runtime {
            details: format!("failed to spawn comparator: {e}"),
        })
}
