//! World payload, codec boundary and the immutable snapshot shared by workers.
//!
//! The dungeon generator, renderer and physics builder live elsewhere; this
//! module only defines what crosses the wire and how it is encoded.

use crate::error::Result;
use crate::types::WorldId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// World data
// ---------------------------------------------------------------------------

/// Voxel dungeon structure, as produced by the procedural generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DungeonWorld {
    pub seed: u64,
    /// Bumped by the host on every regeneration.
    pub generation: u64,
    /// Extent in voxels: (x, y, z).
    pub size: (u32, u32, u32),
    /// Block ids, x-major then y then z.
    pub voxels: Vec<u8>,
}

impl DungeonWorld {
    /// Deterministic filler dungeon: a solid shell with carved rooms.
    ///
    /// Stand-in for the real generator so the binaries and tests have a
    /// world of realistic size to move around.
    pub fn generate(seed: u64, size: (u32, u32, u32)) -> Self {
        let (sx, sy, sz) = size;
        let mut voxels = Vec::with_capacity((sx * sy * sz) as usize);
        let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
        for z in 0..sz {
            for y in 0..sy {
                for x in 0..sx {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let shell = x == 0 || y == 0 || z == 0 || x + 1 == sx || z + 1 == sz;
                    let block = if shell {
                        1
                    } else if (x / 8 + z / 8).wrapping_add(seed as u32) % 3 == 0 {
                        0
                    } else {
                        (state % 4) as u8
                    };
                    voxels.push(block);
                }
            }
        }
        Self {
            seed,
            generation: 0,
            size,
            voxels,
        }
    }
}

/// A live entity captured alongside the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub archetype: String,
    pub position: [f32; 3],
}

/// Everything a receiver needs to start playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldPayload {
    pub world: DungeonWorld,
    pub entities: Vec<EntityState>,
}

impl WorldPayload {
    pub fn new(world: DungeonWorld) -> Self {
        Self {
            world,
            entities: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec boundary
// ---------------------------------------------------------------------------

/// Deterministic serializer for the world payload.
pub trait WorldCodec: Send + Sync {
    fn encode(&self, payload: &WorldPayload) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<WorldPayload>;

    /// Identifier of the world structure alone; entities do not affect it.
    fn world_id(&self, world: &DungeonWorld) -> Result<WorldId>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWorldCodec;

impl WorldCodec for JsonWorldCodec {
    fn encode(&self, payload: &WorldPayload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<WorldPayload> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn world_id(&self, world: &DungeonWorld) -> Result<WorldId> {
        Ok(WorldId::of(&serde_json::to_vec(world)?))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serialized world at one point in time.
///
/// Captured once per transfer round and shared read-only by every transfer
/// worker; cloning is a refcount bump.
#[derive(Debug, Clone)]
pub struct WorldSnapshot {
    pub world_id: WorldId,
    pub bytes: Bytes,
}

impl WorldSnapshot {
    pub fn capture(payload: &WorldPayload, codec: &dyn WorldCodec) -> Result<Self> {
        let world_id = codec.world_id(&payload.world)?;
        let bytes = Bytes::from(codec.encode(payload)?);
        log::debug!(
            "Captured snapshot of world {} ({} bytes, {} entities)",
            world_id,
            bytes.len(),
            payload.entities.len()
        );
        Ok(Self { world_id, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
