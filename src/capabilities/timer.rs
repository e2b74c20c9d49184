use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

/// One-shot delay, driven by the shell's clock.
///
/// The core never sleeps; it asks the shell to notify it after a number of
/// milliseconds and carries on. Staleness is handled by the caller (events
/// produced by expired windows carry a generation the app discards).
pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOperation {
    NotifyAfter { millis: u64 },
}

impl Operation for TimerOperation {
    type Output = ();
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<Ev> Timer<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn notify_after<F>(&self, millis: u64, make_event: F)
    where
        F: FnOnce() -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            context
                .request_from_shell(TimerOperation::NotifyAfter { millis })
                .await;
            context.update_app(make_event());
        });
    }
}
