use crate::shift::context::RunContext;
use crate::store::{Flags, MailStore, StoreError, timed};

/// Drive `identity` to read + unflagged. Servers may apply half of a flag
/// update before the rest becomes visible, so the update is re-issued and
/// re-read up to `flag_settle_attempts` times with a settle delay in
/// between. `NotFound` is returned immediately; anything else only once the
/// settle budget is spent.
pub async fn normalize(
    store: &dyn MailStore,
    ctx: &RunContext,
    folder: &str,
    identity: &str,
) -> Result<(), StoreError> {
    let rounds = ctx.flag_settle_attempts.max(1);
    let mut last = None;

    for round in 1..=rounds {
        let observed = match timed(
            ctx.op_timeout,
            store.set_flags(folder, identity, Flags::ARCHIVED),
        )
        .await
        {
            Ok(()) => timed(ctx.op_timeout, store.fetch_flags(folder, identity)).await,
            Err(err) => Err(err),
        };

        match observed {
            Ok(flags) if flags == Flags::ARCHIVED => return Ok(()),
            Ok(flags) => {
                tracing::debug!(
                    identity,
                    folder,
                    round,
                    seen = flags.seen,
                    flagged = flags.flagged,
                    "flags not settled yet"
                );
                last = Some(StoreError::Transient(format!(
                    "flags still seen={} flagged={} after {round} round(s)",
                    flags.seen, flags.flagged
                )));
            }
            Err(err) if err.is_not_found() => return Err(err),
            Err(err) => last = Some(err),
        }

        if round < rounds {
            tokio::time::sleep(ctx.flag_settle_delay).await;
        }
    }

    Err(last.unwrap_or_else(|| StoreError::Transient("flags did not settle".to_string())))
}
