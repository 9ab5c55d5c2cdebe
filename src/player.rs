//! Remote control of the active connect device.
//!
//! Commands are addressed from the device that started playback (the
//! origin) to the device currently playing (the active device). Both are
//! resolved when the player is created, and playback is transferred to the
//! active device before any command is sent.
//!
//! # Example
//!
//! ```rust
//! use spotweb::player::Player;
//!
//! let player = Player::new(channel, None).await?;
//! player.pause().await?;
//! player.set_volume(0.5).await?;
//! ```

use std::{fmt, sync::Arc, time::Duration};

use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{
    dealer::Channel,
    error::{Error, ErrorKind, Result},
    protocol::connect_state::{
        Command, CommandBody, LoggingParams, Transfer, TransferOptions, Volume, MAX_VOLUME,
    },
    util,
};

pub struct Player {
    channel: Arc<Channel>,
    origin_device_id: String,
    active_device_id: String,
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("origin_device_id", &self.origin_device_id)
            .field("active_device_id", &self.active_device_id)
            .finish_non_exhaustive()
    }
}

impl Player {
    /// Number of steps of a volume fade.
    const FADE_STEPS: u32 = 100;

    /// Resolves the origin and active devices and transfers playback.
    ///
    /// `target` overrides the active device reported by connect-state.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if no active device is known
    /// and no target is given, or if the player state has no origin device.
    /// Returns [`ErrorKind::Player`] if the transfer is rejected.
    pub async fn new(channel: Arc<Channel>, target: Option<&str>) -> Result<Self> {
        let cluster = channel.renew_state().await?;

        let active_device_id = target
            .map(ToOwned::to_owned)
            .or(cluster.active_device_id)
            .ok_or_else(|| {
                Error::invalid_argument("no active device, a target device id is required")
            })?;

        let state = cluster.player_state.unwrap_or_default();
        let origin_device_id = state
            .play_origin
            .and_then(|origin| origin.device_identifier)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::invalid_argument("could not determine origin device"))?;

        let player = Self {
            channel,
            origin_device_id,
            active_device_id,
        };
        player
            .transfer(&player.origin_device_id, &player.active_device_id, state.is_paused)
            .await?;

        Ok(player)
    }

    #[must_use]
    pub fn origin_device_id(&self) -> &str {
        &self.origin_device_id
    }

    #[must_use]
    pub fn active_device_id(&self) -> &str {
        &self.active_device_id
    }

    /// Transfers playback between devices, keeping it paused if it was.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the transfer is rejected.
    pub async fn transfer(&self, from: &str, to: &str, paused: bool) -> Result<()> {
        let body = Transfer {
            transfer_options: TransferOptions {
                restore_paused: if paused { "pause" } else { "resume" },
            },
            command_id: util::random_hex(32),
        };
        let path = format!("connect-state/v1/connect/transfer/from/{from}/to/{to}");
        self.send(Method::POST, &path, &body).await?;
        debug!("transferred playback from {from} to {to}");
        Ok(())
    }

    async fn send<T: Serialize + ?Sized>(&self, method: Method, path: &str, body: &T) -> Result<()> {
        let url = self.channel.endpoints().spclient.join(path)?;
        let request = self.channel.http().json(method, url, body)?;
        self.channel
            .send_authorized(request, ErrorKind::Player)
            .await?;
        Ok(())
    }

    async fn command(&self, endpoint: &str, value: Map<String, Value>) -> Result<()> {
        let body = Command {
            command: CommandBody {
                value,
                endpoint: endpoint.to_owned(),
                logging_params: LoggingParams {
                    command_id: util::random_hex(32),
                    ..LoggingParams::default()
                },
            },
        };

        let path = format!(
            "connect-state/v1/player/command/from/{}/to/{}",
            self.origin_device_id, self.active_device_id
        );
        trace!("player command: {endpoint}");
        self.send(Method::POST, &path, &body).await
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn pause(&self) -> Result<()> {
        self.command("pause", Map::new()).await
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn resume(&self) -> Result<()> {
        self.command("resume", Map::new()).await
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn skip_next(&self) -> Result<()> {
        self.command("skip_next", Map::new()).await
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn skip_prev(&self) -> Result<()> {
        self.command("skip_prev", Map::new()).await
    }

    /// Seeks to `position` in the current track.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn seek_to(&self, position: Duration) -> Result<()> {
        let millis = u64::try_from(position.as_millis()).unwrap_or(u64::MAX);
        self.command("seek_to", value(json!({ "value": millis })))
            .await
    }

    /// Seeks to the start of the current track.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn restart_song(&self) -> Result<()> {
        self.seek_to(Duration::ZERO).await
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn set_shuffle(&self, shuffle: bool) -> Result<()> {
        self.command("set_shuffling_context", value(json!({ "value": shuffle })))
            .await
    }

    /// Repeats the current track and context, or stops repeating.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn repeat_track(&self, repeat: bool) -> Result<()> {
        self.command(
            "set_options",
            value(json!({ "repeating_context": repeat, "repeating_track": repeat })),
        )
        .await
    }

    /// Queues a track, given as an id or a `spotify:track:` URI.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Player`] if the command is rejected.
    pub async fn add_to_queue(&self, track: &str) -> Result<()> {
        let track_id = track.strip_prefix("spotify:track:").unwrap_or(track);
        self.command(
            "add_to_queue",
            value(json!({
                "track": {
                    "uri": format!("spotify:track:{track_id}"),
                    "metadata": {"is_queued": "true"},
                    "provider": "queue",
                }
            })),
        )
        .await
    }

    /// Sets the volume of the active device, from `0.0` to `1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] for volumes outside the range
    /// and [`ErrorKind::Player`] if the change is rejected.
    pub async fn set_volume(&self, volume: f64) -> Result<()> {
        let body = Volume {
            volume: to_sixteen_bit(volume)?,
        };
        let path = format!(
            "connect-state/v1/connect/volume/from/{}/to/{}",
            self.origin_device_id, self.active_device_id
        );
        self.send(Method::PUT, &path, &body).await
    }

    /// Gradually changes the volume of the active device to `volume` over
    /// `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] for volumes outside the range
    /// or a zero duration, and [`ErrorKind::Player`] if a step is rejected.
    pub async fn fade_volume(&self, volume: f64, duration: Duration) -> Result<()> {
        let target = f64::from(to_sixteen_bit(volume)?);
        if duration.is_zero() {
            return Err(Error::invalid_argument("fade duration must be positive"));
        }

        let current = self
            .channel
            .devices()
            .await?
            .get(&self.active_device_id)
            .map_or(0.0, |device| f64::from(device.volume));
        if (current - target).abs() < 1.0 {
            return Ok(());
        }

        let step_duration = duration / Self::FADE_STEPS;
        let increment = (target - current) / f64::from(Self::FADE_STEPS);
        let max = f64::from(MAX_VOLUME);

        let mut level = current;
        for _ in 0..Self::FADE_STEPS {
            level = (level + increment).clamp(0.0, max);
            self.set_volume(level / max).await?;
            tokio::time::sleep(step_duration).await;
        }

        self.set_volume(volume).await
    }
}

/// Maps a `0.0..=1.0` volume onto the 16-bit device range.
fn to_sixteen_bit(volume: f64) -> Result<u16> {
    if !(0.0..=1.0).contains(&volume) {
        return Err(Error::invalid_argument(format!(
            "volume must be between 0.0 and 1.0, got {volume}"
        )));
    }

    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let level = (volume * f64::from(MAX_VOLUME)) as u16;
    Ok(level)
}

fn value(object: Value) -> Map<String, Value> {
    match object {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dealer::tests::{config_for, dealer_server, seeded_session, CLUSTER, INIT};
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    async fn mount_cluster(server: &MockServer, cluster: &str) {
        Mock::given(method("PUT"))
            .and(path("/connect-state/v1/devices/hobs_DEVICE"))
            .respond_with(ResponseTemplate::new(200).set_body_string(cluster.to_owned()))
            .mount(server)
            .await;
    }

    async fn channel(server: &MockServer) -> Arc<Channel> {
        let dealer = dealer_server(INIT, Vec::new()).await;
        let config = config_for(server, dealer);
        Arc::new(
            Channel::open(seeded_session(&config), &config, "DEVICE")
                .await
                .unwrap(),
        )
    }

    #[test]
    fn volume_maps_to_sixteen_bits() {
        assert_eq!(to_sixteen_bit(0.0).unwrap(), 0);
        assert_eq!(to_sixteen_bit(0.5).unwrap(), 32767);
        assert_eq!(to_sixteen_bit(1.0).unwrap(), 65535);
        assert_eq!(
            to_sixteen_bit(1.5).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
        assert!(to_sixteen_bit(-0.1).is_err());
        assert!(to_sixteen_bit(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn transfers_then_addresses_commands() {
        let server = MockServer::start().await;
        mount_cluster(&server, CLUSTER).await;
        Mock::given(method("POST"))
            .and(path("/connect-state/v1/connect/transfer/from/ORIGIN/to/ACTIVE"))
            .and(body_partial_json(serde_json::json!({
                "transfer_options": {"restore_paused": "pause"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/connect-state/v1/player/command/from/ORIGIN/to/ACTIVE"))
            .and(body_partial_json(serde_json::json!({
                "command": {
                    "endpoint": "add_to_queue",
                    "track": {
                        "uri": "spotify:track:abc",
                        "metadata": {"is_queued": "true"},
                        "provider": "queue"
                    },
                    "logging_params": {"page_instance_ids": [], "interaction_ids": []}
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/connect-state/v1/player/command/from/ORIGIN/to/ACTIVE"))
            .and(body_partial_json(serde_json::json!({
                "command": {"endpoint": "seek_to", "value": 0}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/connect-state/v1/connect/volume/from/ORIGIN/to/ACTIVE"))
            .and(body_partial_json(serde_json::json!({"volume": 65535})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = channel(&server).await;
        let player = Player::new(Arc::clone(&channel), None).await.unwrap();
        assert_eq!(player.origin_device_id(), "ORIGIN");
        assert_eq!(player.active_device_id(), "ACTIVE");
        assert!(format!("{player:?}").contains("ACTIVE"));

        player.add_to_queue("spotify:track:abc").await.unwrap();
        player.restart_song().await.unwrap();
        player.set_volume(1.0).await.unwrap();

        let err = player.set_volume(2.0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_origin_is_rejected_before_commands() {
        let server = MockServer::start().await;
        mount_cluster(
            &server,
            r#"{"active_device_id":"ACTIVE","player_state":{"is_paused":false}}"#,
        )
        .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let channel = channel(&server).await;
        let err = Player::new(Arc::clone(&channel), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_active_device_needs_a_target() {
        let server = MockServer::start().await;
        mount_cluster(
            &server,
            r#"{"player_state":{"play_origin":{"device_identifier":"ORIGIN"}}}"#,
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/connect-state/v1/connect/transfer/from/ORIGIN/to/TARGET"))
            .and(body_partial_json(serde_json::json!({
                "transfer_options": {"restore_paused": "resume"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = channel(&server).await;
        let err = Player::new(Arc::clone(&channel), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let player = Player::new(Arc::clone(&channel), Some("TARGET")).await.unwrap();
        assert_eq!(player.active_device_id(), "TARGET");

        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_commands_are_player_errors() {
        let server = MockServer::start().await;
        mount_cluster(&server, CLUSTER).await;
        Mock::given(method("POST"))
            .and(path("/connect-state/v1/connect/transfer/from/ORIGIN/to/ACTIVE"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/connect-state/v1/player/command/from/ORIGIN/to/ACTIVE"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no device"))
            .mount(&server)
            .await;

        let channel = channel(&server).await;
        let player = Player::new(Arc::clone(&channel), None).await.unwrap();

        let err = player.pause().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Player);
        assert_eq!(err.upstream.as_deref(), Some("no device"));

        channel.close().await.unwrap();
    }
}
