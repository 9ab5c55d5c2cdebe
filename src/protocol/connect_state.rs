//! Device registration, connect-state snapshots and player commands.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

/// Largest volume understood by connect devices.
pub const MAX_VOLUME: u16 = u16::MAX;

/// Build string presented when registering a device.
pub const CLIENT_VERSION: &str = "harmony:4.43.2-a61ecaf5";

/// Body of `track-playback/v1/devices`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisterDevice<'a> {
    pub device: DeviceDescriptor<'a>,
    pub outro_endcontent_snooping: bool,
    pub connection_id: &'a str,
    pub client_version: &'a str,
    pub volume: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor<'a> {
    pub brand: &'a str,
    pub capabilities: Capabilities,
    pub device_id: &'a str,
    pub device_type: &'a str,
    pub metadata: Map<String, Value>,
    pub model: &'a str,
    pub name: &'a str,
    pub platform_identifier: &'a str,
    pub is_group: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[expect(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub change_volume: bool,
    pub enable_play_token: bool,
    pub supports_file_media_type: bool,
    pub play_token_lost_behavior: &'static str,
    pub disable_connect: bool,
    pub audio_podcasts: bool,
    pub video_playback: bool,
    pub manifest_formats: &'static [&'static str],
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            change_volume: true,
            enable_play_token: true,
            supports_file_media_type: true,
            play_token_lost_behavior: "pause",
            disable_connect: false,
            audio_podcasts: true,
            video_playback: true,
            manifest_formats: &[
                "file_ids_mp3",
                "file_urls_mp3",
                "manifest_urls_audio_ad",
                "manifest_ids_video",
                "file_urls_external",
                "file_ids_mp4",
                "file_ids_mp4_dual",
                "manifest_urls_audio_ad",
            ],
        }
    }
}

impl<'a> RegisterDevice<'a> {
    #[must_use]
    pub fn new(device_id: &'a str, name: &'a str, connection_id: &'a str) -> Self {
        Self {
            device: DeviceDescriptor {
                brand: "spotify",
                capabilities: Capabilities::default(),
                device_id,
                device_type: "computer",
                metadata: Map::new(),
                model: "web_player",
                name,
                platform_identifier: "web_player windows 10;chrome 120.0.0.0;desktop",
                is_group: false,
            },
            outro_endcontent_snooping: false,
            connection_id,
            client_version: CLIENT_VERSION,
            volume: MAX_VOLUME,
        }
    }
}

/// Body of the connect-state `PUT` for this device.
#[must_use]
pub fn connect_request() -> Value {
    serde_json::json!({
        "member_type": "CONNECT_STATE",
        "device": {
            "device_info": {
                "capabilities": {
                    "can_be_player": false,
                    "hidden": true,
                    "needs_full_player_state": true,
                }
            }
        }
    })
}

/// Snapshot returned by the connect-state endpoint.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub player_state: Option<PlayerState>,

    #[serde(default)]
    pub devices: HashMap<String, Device>,

    #[serde(default)]
    pub active_device_id: Option<String>,
}

#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub timestamp: i64,

    pub context_uri: Option<String>,
    pub context_url: Option<String>,

    pub play_origin: Option<PlayOrigin>,

    pub track: Option<Track>,
    pub playback_id: Option<String>,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub position_as_of_timestamp: i64,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub duration: i64,

    pub is_playing: bool,
    pub is_paused: bool,
    pub is_buffering: bool,

    pub options: PlaybackOptions,

    pub prev_tracks: Vec<Track>,
    pub next_tracks: Vec<Track>,

    pub session_id: Option<String>,
    pub queue_revision: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlayOrigin {
    pub feature_identifier: Option<String>,
    pub feature_version: Option<String>,
    pub device_identifier: Option<String>,
    pub referrer_identifier: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    pub shuffling_context: bool,
    pub repeating_context: bool,
    pub repeating_track: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Track {
    pub uri: String,
    pub uid: Option<String>,
    pub provider: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Device {
    pub device_id: Option<String>,
    pub name: String,
    pub device_type: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub can_play: bool,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub volume: u32,

    pub is_private_session: bool,
    pub capabilities: Value,
}

/// A player command addressed through connect-state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Command {
    pub command: CommandBody,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandBody {
    #[serde(flatten)]
    pub value: Map<String, Value>,
    pub endpoint: String,
    pub logging_params: LoggingParams,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoggingParams {
    pub command_id: String,
    pub page_instance_ids: Vec<String>,
    pub interaction_ids: Vec<String>,
}

/// Body of a playback transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub transfer_options: TransferOptions,
    pub command_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferOptions {
    pub restore_paused: &'static str,
}

/// Body of a volume change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub volume: u16,
}
