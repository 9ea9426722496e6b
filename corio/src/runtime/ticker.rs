use bitflags::bitflags;

#[derive(Debug, Default)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Implemented by the event loop policy. The policy consumes the tick and
/// turns it into `TickerEvents`, keeping the counting separate from the
/// decisions.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// A request to submit any pending submission queue entries to the kernel.
        const SUBMIT_SQES = 1;

        /// A request to process any available completion queue entries from the kernel.
        const PROCESS_CQES = 1 << 1;

        /// Look at the global injector before the local ready queue.
        const POP_GLOBAL_QUEUE = 1 << 2;

        /// Fire due timers and collect tasks woken from other threads.
        const FIRE_TIMERS = 1 << 3;

        /// A request to shut down the runtime.
        const SHUTDOWN = 1 << 4;
    }
}
