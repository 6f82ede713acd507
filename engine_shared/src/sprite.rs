//! `NetSprite`: the thin carrier of replicated per-entity state that
//! game-specific sprite classes build on. The framework only moves
//! `(position, angle, visibility)` around; collision, rendering, and input
//! live entirely above this layer.

use serde::{Deserialize, Serialize};

use crate::net::{ClientId, Payload};

/// 2D vector, used for sprite position. Kept separate from any 3D/physics
/// math since the sprites this framework replicates are 2D.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(self.x + (to.x - self.x) * t, self.y + (to.y - self.y) * t)
    }
}

/// Replicated state for one networked sprite. Visibility is not part of the
/// wire payload: receiving any state at all is what makes a remote sprite
/// visible, matching the original engine's `set_net_state` behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SpriteState {
    position: Vec2,
    angle: f32,
}

/// A sprite whose position/angle/visibility is replicated over the network.
/// `net_id` is the owning client; `sprite_id` distinguishes multiple
/// sprites owned by the same client. Remote (non-local) sprites start
/// hidden until the first state update arrives.
#[derive(Debug, Clone)]
pub struct NetSprite {
    pub net_id: Option<ClientId>,
    pub sprite_id: uuid::Uuid,
    pub is_local: bool,
    pub position: Vec2,
    pub angle: f32,
    pub visible: bool,
}

impl NetSprite {
    pub fn new(net_id: Option<ClientId>, is_local: bool) -> Self {
        Self {
            net_id,
            sprite_id: uuid::Uuid::new_v4(),
            is_local,
            position: Vec2::ZERO,
            angle: 0.0,
            visible: is_local,
        }
    }

    /// Serializes this sprite's replicated state to an opaque payload
    /// suitable for `Client::send_update`.
    pub fn to_payload(&self) -> anyhow::Result<Payload> {
        let state = SpriteState {
            position: self.position,
            angle: self.angle,
        };
        Ok(serde_json::to_value(state)?)
    }

    /// Applies a remote payload to this sprite, making it visible. Malformed
    /// payloads are ignored rather than propagated, matching the framework's
    /// "corrupt payloads are discarded" policy.
    pub fn apply_payload(&mut self, payload: &Payload) {
        if let Ok(state) = serde_json::from_value::<SpriteState>(payload.clone()) {
            self.position = state.position;
            self.angle = state.angle;
            self.visible = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip_preserves_position_and_angle() {
        let mut a = NetSprite::new(Some(ClientId::new_random()), true);
        a.position = Vec2::new(1.0, 2.0);
        a.angle = 90.0;

        let payload = a.to_payload().unwrap();

        let mut b = NetSprite::new(None, false);
        assert!(!b.visible);
        b.apply_payload(&payload);
        assert_eq!(b.position, a.position);
        assert_eq!(b.angle, a.angle);
        assert!(b.visible);
    }

    #[test]
    fn malformed_payload_is_ignored() {
        let mut sprite = NetSprite::new(None, false);
        let before = sprite.position;
        sprite.apply_payload(&serde_json::json!("not a sprite state"));
        assert_eq!(sprite.position, before);
    }
}
