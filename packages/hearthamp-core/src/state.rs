//! Core data model: sources, zones, groups, streams, presets, and the
//! volume math that ties zone `vol`/`vol_f` together.
//!
//! Every public type here is a plain value type with a `Default` impl;
//! the controller is the only thing that owns a live, mutable `State`.
//! Everything else works with deep copies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lower bound of the amplifier's volume range, in dB.
pub const MIN_DB: i32 = -80;
/// Upper bound of the amplifier's volume range, in dB.
pub const MAX_DB: i32 = 0;
/// Register value written to mute a zone's volume register.
pub const MUTE_REG: u8 = 80;

/// Reserved entity ids that id-allocation must never hand out.
pub const STREAM_ID_AUX: u32 = 995;
pub const STREAM_ID_RCA_BASE: u32 = 996;
pub const STREAM_ID_ANNOUNCE_ACTIVE: u32 = 9998;
pub const STREAM_ID_ANNOUNCE_SAVED: u32 = 9999;
pub const PRESET_ID_MUTE_ALL: u32 = 10000;

pub const GROUP_ID_BASE: u32 = 100;
pub const STREAM_ID_BASE: u32 = 1000;

/// Converts a dB attenuation value into the register encoding the hardware
/// expects (`reg = -dB`, clamped to the supported range).
pub fn db_to_reg(db: i32) -> u8 {
    (-db.clamp(MIN_DB, MAX_DB)) as u8
}

/// Inverse of [`db_to_reg`].
pub fn reg_to_db(reg: u8) -> i32 {
    -(reg.min(MUTE_REG) as i32)
}

/// Projects a dB value onto the linear `[0, 1]` fader range.
pub fn db_to_f(db: i32) -> f32 {
    (db - MIN_DB) as f32 / (MAX_DB - MIN_DB) as f32
}

/// Inverse of [`db_to_f`]; input is clamped to `[0, 1]` first.
pub fn f_to_db(f: f32) -> i32 {
    let f = f.clamp(0.0, 1.0);
    (f * (MAX_DB - MIN_DB) as f32).round() as i32 + MIN_DB
}

/// One of the amplifier's logical audio inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: u32,
    pub name: String,
    /// `""` (disconnected), `"local"`, or `"stream=<id>"`.
    #[serde(default)]
    pub input: String,
}

/// One amplified output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: u32,
    pub name: String,
    pub source_id: u32,
    #[serde(default)]
    pub mute: bool,
    pub vol: i32,
    #[serde(default)]
    pub vol_f: f32,
    pub vol_min: i32,
    pub vol_max: i32,
    #[serde(default)]
    pub disabled: bool,
}

impl Zone {
    /// Recomputes `vol_f` from `vol`. The controller calls this on every
    /// mutation and on every outward-facing snapshot so the two fields can
    /// never drift even if a migration path forgot to touch `vol_f`.
    pub fn canonicalize(&mut self) {
        self.vol = self.vol.clamp(self.vol_min, self.vol_max);
        self.vol_f = db_to_f(self.vol);
    }
}

/// A named set of zones for bulk control. `source_id`/`mute`/`vol_delta`/
/// `vol_f` are aggregates recomputed from the member zones, never stored
/// authoritatively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub zones: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_delta: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_f: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

impl Group {
    /// Recomputes the aggregate fields from the current state's zones.
    /// Member ids that no longer exist are ignored.
    pub fn recompute_aggregates(&mut self, zones: &[Zone]) {
        let members: Vec<&Zone> = self
            .zones
            .iter()
            .filter_map(|id| zones.iter().find(|z| z.id == *id))
            .collect();

        if members.is_empty() {
            self.source_id = None;
            self.vol_delta = None;
            self.vol_f = None;
            self.mute = None;
            return;
        }

        let first_source = members[0].source_id;
        self.source_id = if members.iter().all(|z| z.source_id == first_source) {
            Some(first_source)
        } else {
            None
        };

        self.mute = Some(members.iter().all(|z| z.mute));

        let avg_db = members.iter().map(|z| z.vol).sum::<i32>() / members.len() as i32;
        self.vol_delta = Some(avg_db);
        self.vol_f = Some(db_to_f(avg_db));
    }
}

/// Current metadata for a stream's live playback, as reported by its
/// [`crate::streamer::Streamer`] implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "img_url")]
    pub img_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i32>,
}

/// A configured audio producer (internet radio URL, AirPlay endpoint, a
/// hardware passthrough, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub info: StreamInfo,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browsable: Option<bool>,
}

/// A saved partial state, applied on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PresetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<PresetCommand>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceUpdate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<ZoneUpdate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupUpdate>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetCommand {
    pub stream_id: u32,
    pub cmd: String,
}

/// Patch payload for `PATCH /api/sources/{id}`. `id` identifies the target
/// when the update travels inside a [`PresetState`]; it is ignored by the
/// HTTP handler, which takes the id from the path instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceUpdate {
    #[serde(default)]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

/// Patch payload for zone mutations. Volume precedence is
/// `vol_f > vol > vol_delta_f` (see the controller's zone-update path).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneUpdate {
    #[serde(default)]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_f: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_delta_f: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

/// Patch payload for group mutations. `vol` is interpreted as a delta in dB
/// applied to every member (see §4.6 group write semantics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    #[serde(default)]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_f: Option<f32>,
}

/// Patch payload for `PATCH /api/streams/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

/// Patch payload for `PATCH /api/presets/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PresetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<PresetCommand>>,
}

/// Request body for `POST /api/announce`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub media: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_f: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<u32>,
    #[serde(default)]
    pub zones: Vec<u32>,
    #[serde(default)]
    pub groups: Vec<u32>,
}

/// Installation-wide info block: identity fields plus a couple of flags the
/// maintenance workers flip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub version: String,
    #[serde(default)]
    pub offline: bool,
    #[serde(default, rename = "is_update")]
    pub update_available: bool,
    pub units: u32,
    pub zones: u32,
    pub firmware_version: String,
    #[serde(default)]
    pub stream_types: Vec<String>,
    #[serde(default)]
    pub fan_mode: String,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            offline: false,
            update_available: false,
            units: 0,
            zones: 0,
            firmware_version: String::new(),
            stream_types: Vec::new(),
            fan_mode: String::new(),
        }
    }
}

/// The whole persisted/published state tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub streams: Vec<Stream>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub info: Info,
}

impl State {
    /// Recomputes every zone's `vol_f` and every group's aggregates from
    /// their current members. Called before every snapshot leaves the
    /// controller (persist, publish, or HTTP response).
    pub fn canonicalize(&mut self) {
        for zone in &mut self.zones {
            zone.canonicalize();
        }
        let zones = self.zones.clone();
        for group in &mut self.groups {
            group.recompute_aggregates(&zones);
        }
    }

    pub fn source(&self, id: u32) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn zone(&self, id: u32) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn group(&self, id: u32) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn stream(&self, id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == id)
    }

    pub fn preset(&self, id: u32) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }

    /// Next free id for a given entity kind, scoped to its valid range and
    /// skipping reserved built-ins.
    pub fn next_group_id(&self) -> u32 {
        self.groups.iter().map(|g| g.id).max().map_or(GROUP_ID_BASE, |m| m + 1).max(GROUP_ID_BASE)
    }

    pub fn next_stream_id(&self) -> u32 {
        self.streams
            .iter()
            .map(|s| s.id)
            .filter(|id| *id >= STREAM_ID_BASE && *id < STREAM_ID_AUX)
            .max()
            .map_or(STREAM_ID_BASE, |m| m + 1)
    }

    pub fn next_preset_id(&self) -> u32 {
        self.presets
            .iter()
            .map(|p| p.id)
            .filter(|id| *id >= 1 && *id < PRESET_ID_MUTE_ALL)
            .max()
            .map_or(1, |m| m + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_to_reg_round_trips_within_range() {
        for db in MIN_DB..=MAX_DB {
            assert_eq!(reg_to_db(db_to_reg(db)), db);
        }
    }

    #[test]
    fn db_to_reg_clamps_out_of_range() {
        assert_eq!(db_to_reg(100), 0);
        assert_eq!(db_to_reg(-200), MUTE_REG);
    }

    #[test]
    fn db_to_f_round_trips_within_one_db() {
        for f in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let back = db_to_f(f_to_db(f));
            assert!((back - f).abs() < 1.0 / (MAX_DB - MIN_DB).abs() as f32 + 0.01);
        }
    }

    #[test]
    fn zone_canonicalize_clamps_and_derives_vol_f() {
        let mut z = Zone {
            id: 0,
            name: "Patio".into(),
            source_id: 0,
            mute: false,
            vol: 500,
            vol_f: 0.0,
            vol_min: -80,
            vol_max: 0,
            disabled: false,
        };
        z.canonicalize();
        assert_eq!(z.vol, 0);
        assert_eq!(z.vol_f, 1.0);
    }

    #[test]
    fn group_aggregates_absent_when_members_disagree() {
        let zones = vec![
            Zone { id: 0, name: "A".into(), source_id: 0, mute: true, vol: -10, vol_f: 0.0, vol_min: -80, vol_max: 0, disabled: false },
            Zone { id: 1, name: "B".into(), source_id: 1, mute: false, vol: -30, vol_f: 0.0, vol_min: -80, vol_max: 0, disabled: false },
        ];
        let mut g = Group { id: 100, name: "G".into(), zones: vec![0, 1], source_id: None, vol_delta: None, vol_f: None, mute: None };
        g.recompute_aggregates(&zones);
        assert_eq!(g.source_id, None);
        assert_eq!(g.mute, Some(false));
        assert_eq!(g.vol_delta, Some(-20));
    }

    #[test]
    fn empty_group_has_no_aggregates() {
        let mut g = Group { id: 100, name: "G".into(), zones: vec![], source_id: None, vol_delta: None, vol_f: None, mute: None };
        g.recompute_aggregates(&[]);
        assert_eq!(g.source_id, None);
        assert_eq!(g.mute, None);
    }

    #[test]
    fn id_allocation_skips_reserved_ranges() {
        let mut s = State::default();
        s.streams.push(Stream { id: STREAM_ID_AUX, name: "Aux".into(), kind: "aux".into(), info: StreamInfo::default(), config: HashMap::new(), disabled: None, browsable: None });
        assert_eq!(s.next_stream_id(), STREAM_ID_BASE);
    }
}
