//! Transaction engine (spec §4.C6): check-out, run the body on the lane,
//! check back in (or close, if destroyed mid-flight).

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::clock::Deadline;
use crate::error::Error;
use crate::handle::registry::{CheckInOutcome, CheckOutFailure, HandleRegistry};
use crate::handle::HandleId;
use crate::lane::{Lane, LaneOutcome};
use crate::primitives::RawHandle;

#[instrument(skip(registry, lane, body), fields(handle = id.raw))]
pub async fn run<T, Op>(
    registry: &HandleRegistry,
    lane: &Lane,
    id: HandleId,
    deadline: Option<Deadline>,
    cancel: Option<&CancellationToken>,
    body: impl FnOnce(&mut RawHandle) -> Result<T, Op> + Send + 'static,
) -> Result<T, Error<Op>>
where
    T: Send + 'static,
    Op: std::error::Error + Send + 'static,
{
    let mut handle = match registry.check_out(id, cancel).await {
        Ok(handle) => handle,
        Err(CheckOutFailure::Handle(e)) => return Err(Error::Handle(e)),
        Err(CheckOutFailure::Cancelled) => return Err(Error::Cancelled),
    };

    let outcome = lane
        .run(
            deadline,
            cancel,
            move || -> Result<(RawHandle, Result<T, Op>), std::convert::Infallible> {
                let result = body(&mut handle);
                Ok((handle, result))
            },
        )
        .await;

    let (handle, body_result) = match outcome {
        LaneOutcome::Operation(Ok(pair)) => pair,
        LaneOutcome::Operation(Err(never)) => match never {},
        LaneOutcome::Lane(e) => {
            // The handle never ran through the job closure (rejected before
            // execution); it is lost to this transaction. This can only
            // happen if the lane rejects at admission time, before the
            // handle was moved into the job — but we moved it unconditionally
            // above, so a lane rejection here means the job itself never ran
            // and the handle is gone with it. Treat as a lane-level failure;
            // the handle is leaked from the registry's perspective (it was
            // already taken out via check_out). This matches the spec's
            // framing of lane infrastructure failures as distinct from
            // operation failures: the caller must not assume the handle is
            // still registered.
            registry.destroy(id);
            return Err(Error::Lane(e.into()));
        }
        LaneOutcome::Cancelled => {
            // Cancelled before the job ever ran; the handle went down with
            // the dropped closure and cannot be checked back in.
            registry.destroy(id);
            return Err(Error::Cancelled);
        }
        LaneOutcome::CancelledAfterCompletion(Ok(pair)) => {
            // Run-once-enqueued: the job executed to completion before the
            // cancellation was observed. The handle checks back in exactly
            // as on the non-cancelled path; only the caller's verdict
            // differs.
            let (handle, _body_result) = pair;
            match registry.check_in(id, handle) {
                CheckInOutcome::Restored => {}
                CheckInOutcome::NeedsClose(handle) => {
                    let _ = lane
                        .run::<(), crate::primitives::OpError>(None, None, move || handle.close())
                        .await;
                }
            }
            return Err(Error::Cancelled);
        }
        LaneOutcome::CancelledAfterCompletion(Err(never)) => match never {},
    };

    match registry.check_in(id, handle) {
        CheckInOutcome::Restored => {}
        CheckInOutcome::NeedsClose(handle) => {
            let _ = lane
                .run::<(), crate::primitives::OpError>(None, None, move || handle.close())
                .await;
        }
    }

    body_result.map_err(Error::Operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::LaneConfig;
    use crate::primitives::{HandleMode, OpenOptionsFlags};

    #[tokio::test]
    async fn run_executes_body_and_checks_handle_back_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::path::ValidPath::new(dir.path().join("f")).unwrap();
        let handle = RawHandle::open(
            &path,
            HandleMode::Write,
            OpenOptionsFlags {
                create: true,
                truncate: true,
                append: false,
            },
        )
        .unwrap();

        let registry = HandleRegistry::new(1);
        let id = registry.insert(handle);
        let lane = Lane::new(LaneConfig::default().with_workers(1));

        let written = run(&registry, &lane, id, None, None, |h| h.write(b"hi")).await;
        assert!(written.is_ok());
        assert!(registry.is_valid(id));

        lane.shutdown();
    }

    #[tokio::test]
    async fn run_propagates_body_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::path::ValidPath::new(dir.path().join("f")).unwrap();
        let handle = RawHandle::open(
            &path,
            HandleMode::Write,
            OpenOptionsFlags {
                create: true,
                truncate: true,
                append: false,
            },
        )
        .unwrap();

        let registry = HandleRegistry::new(1);
        let id = registry.insert(handle);
        let lane = Lane::new(LaneConfig::default().with_workers(1));

        let result: Result<(), Error<crate::primitives::OpError>> =
            run(&registry, &lane, id, None, None, |_h| {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "boom").into())
            })
            .await;
        assert!(matches!(result, Err(Error::Operation(_))));
        assert!(registry.is_valid(id));

        lane.shutdown();
    }
}
