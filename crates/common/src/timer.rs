//! Shared timer worker
//!
//! Emits the 1-second event on every tick and the 5-second event on every
//! fifth. Exits once the bus refuses an event (terminate).

use crate::runtime::{BusEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

pub fn spawn_timer<E: BusEvent>(bus: Arc<EventBus<E>>, tick_1s: E, tick_5s: E) -> JoinHandle<()> {
    tokio::spawn(async move {
        trace!("Timer starting");
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ctr = 0u8;

        loop {
            interval.tick().await;
            if !bus.enqueue(tick_1s.clone()).await {
                break;
            }
            ctr += 1;
            if ctr >= 5 {
                ctr = 0;
                if !bus.enqueue(tick_5s.clone()).await {
                    break;
                }
            }
        }
        trace!("Timer quit");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum Tick {
        Terminate,
        One,
        Five,
    }

    impl BusEvent for Tick {
        fn mask_bit(&self) -> u32 {
            match self {
                Tick::Terminate => 0,
                Tick::One => 0x01,
                Tick::Five => 0x02,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_cadence() {
        let bus = Arc::new(EventBus::new());
        let mb = bus.register("cadence", 0x03).await;

        let handle = spawn_timer(bus.clone(), Tick::One, Tick::Five);

        // Five virtual seconds: five 1s ticks, one 5s tick
        let mut ones = 0;
        let mut fives = 0;
        for _ in 0..6 {
            match mb.recv().await.unwrap() {
                Tick::One => ones += 1,
                Tick::Five => fives += 1,
                Tick::Terminate => unreachable!(),
            }
        }
        assert_eq!(ones, 5);
        assert_eq!(fives, 1);

        bus.enqueue(Tick::Terminate).await;
        handle.await.unwrap();
    }
}
