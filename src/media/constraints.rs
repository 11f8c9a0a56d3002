use serde::{Deserialize, Serialize};

use super::MediaError;

/// Numeric constraint range (`{min, ideal, max}` on the wire)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Range {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ideal: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl Range {
    pub fn ideal(value: u32) -> Self {
        Self {
            ideal: Some(value),
            ..Default::default()
        }
    }

    pub fn between(min: u32, max: u32) -> Self {
        Self {
            min: Some(min),
            ideal: None,
            max: Some(max),
        }
    }

    fn check(&self, name: &str) -> Result<(), MediaError> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(MediaError::OverConstrained(format!(
                    "{}: min {} > max {}",
                    name, min, max
                )));
            }
        }
        if let Some(ideal) = self.ideal {
            if self.min.is_some_and(|min| ideal < min) || self.max.is_some_and(|max| ideal > max) {
                return Err(MediaError::OverConstrained(format!(
                    "{}: ideal {} outside [{:?}, {:?}]",
                    name, ideal, self.min, self.max
                )));
            }
        }
        if self.max == Some(0) {
            return Err(MediaError::OverConstrained(format!("{}: max is 0", name)));
        }
        Ok(())
    }

    /// Value to use when a single number is needed
    pub fn resolve(&self, fallback: u32) -> u32 {
        self.ideal
            .or(self.max)
            .or(self.min)
            .unwrap_or(fallback)
    }
}

/// Video capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: Range,
    pub height: Range,
    pub frame_rate: Range,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: Range::ideal(1280),
            height: Range::ideal(720),
            frame_rate: Range::ideal(30),
        }
    }
}

/// Audio processing flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Requested local media; `None` means the kind is not captured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoConstraints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConstraints>,
}

impl MediaConstraints {
    /// Default camera + microphone
    pub fn audio_video() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: Some(AudioConstraints::default()),
        }
    }

    pub fn video_only() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: None,
        }
    }

    pub fn validate(&self) -> Result<(), MediaError> {
        if self.video.is_none() && self.audio.is_none() {
            return Err(MediaError::OverConstrained(
                "neither audio nor video requested".to_string(),
            ));
        }
        if let Some(video) = &self.video {
            video.width.check("width")?;
            video.height.check("height")?;
            video.frame_rate.check("frameRate")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        tokio_test::assert_ok!(MediaConstraints::audio_video().validate());
        tokio_test::assert_ok!(MediaConstraints::video_only().validate());
    }

    #[test]
    fn test_inconsistent_range_is_over_constrained() {
        let mut constraints = MediaConstraints::video_only();
        if let Some(video) = constraints.video.as_mut() {
            video.width = Range::between(1920, 1280);
        }
        assert!(matches!(
            constraints.validate(),
            Err(MediaError::OverConstrained(msg)) if msg.starts_with("width")
        ));

        let mut constraints = MediaConstraints::video_only();
        if let Some(video) = constraints.video.as_mut() {
            video.frame_rate = Range {
                min: Some(24),
                ideal: Some(60),
                max: Some(30),
            };
        }
        tokio_test::assert_err!(constraints.validate());
    }

    #[test]
    fn test_nothing_requested() {
        assert!(MediaConstraints::default().validate().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(MediaConstraints::audio_video()).unwrap();
        assert_eq!(json["video"]["width"]["ideal"], 1280);
        assert_eq!(json["video"]["frameRate"]["ideal"], 30);
        assert_eq!(json["audio"]["echoCancellation"], true);
        assert!(json["video"]["width"].get("min").is_none());

        let parsed: MediaConstraints =
            serde_json::from_str(r#"{"video":{"height":{"max":480}}}"#).unwrap();
        let video = parsed.video.unwrap();
        assert_eq!(video.height.max, Some(480));
        assert_eq!(video.width, Range::ideal(1280));
        assert!(parsed.audio.is_none());
    }

    #[test]
    fn test_resolve() {
        assert_eq!(Range::ideal(720).resolve(480), 720);
        assert_eq!(Range::between(10, 20).resolve(15), 20);
        assert_eq!(Range::default().resolve(15), 15);
    }
}
