//! Periodic Heartbeat

use tracing::debug;

use crate::clock::TimeMs;
use crate::model::Model;
use crate::operation::Outbox;
use crate::requests;

#[derive(Debug, Clone, Default)]
pub struct HeartbeatService {
    last_at: Option<TimeMs>,
}

impl HeartbeatService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a Heartbeat once `HeartbeatInterval` has passed; 0 disables
    pub(crate) fn tick(&mut self, model: &Model, outbox: &mut Outbox) {
        let interval = u64::from(model.config().ocpp.heartbeat_interval) * 1000;
        let now = model.now();

        let Some(last_at) = self.last_at else {
            self.last_at = Some(now);
            return;
        };
        if interval == 0 || now.saturating_sub(last_at) < interval {
            return;
        }

        debug!("Heartbeat: Due after {}ms", now.saturating_sub(last_at));
        self.last_at = Some(now);
        outbox.push(requests::heartbeat(model.config()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_model;

    #[test]
    fn test_heartbeat_interval() {
        let (mut model, clock) = test_model(1);
        model.set_heartbeat_interval(60);
        let mut service = HeartbeatService::new();
        let mut outbox = Outbox::new();

        service.tick(&model, &mut outbox);
        clock.advance(59_999);
        service.tick(&model, &mut outbox);
        assert!(outbox.is_empty());

        clock.advance(1);
        service.tick(&model, &mut outbox);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_zero_disables() {
        let (mut model, clock) = test_model(1);
        model.set_heartbeat_interval(0);
        let mut service = HeartbeatService::new();
        let mut outbox = Outbox::new();

        service.tick(&model, &mut outbox);
        clock.advance(10_000_000);
        service.tick(&model, &mut outbox);
        assert!(outbox.is_empty());
    }
}
