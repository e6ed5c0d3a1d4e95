//! Audio scene and ringer mode.

/// Global telephony and ringing state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AudioScene {
    /// No call or ringing in progress.
    #[default]
    Default,
    /// An incoming call is ringing.
    Ringing,
    /// A cellular call is active.
    PhoneCall,
    /// A VoIP call is active.
    PhoneChat,
    /// An incoming VoIP call is ringing.
    VoiceRinging,
}

impl AudioScene {
    /// Returns `true` while something is ringing.
    pub fn is_ringing(self) -> bool {
        matches!(self, Self::Ringing | Self::VoiceRinging)
    }

    /// Returns `true` while a call is established.
    pub fn is_in_call(self) -> bool {
        matches!(self, Self::PhoneCall | Self::PhoneChat)
    }
}

/// User ringer setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RingerMode {
    /// Ring audibly.
    #[default]
    Normal,
    /// Vibrate only.
    Vibrate,
    /// Silent.
    Silent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_classes() {
        assert!(AudioScene::Ringing.is_ringing());
        assert!(AudioScene::VoiceRinging.is_ringing());
        assert!(!AudioScene::PhoneCall.is_ringing());
        assert!(AudioScene::PhoneChat.is_in_call());
        assert!(!AudioScene::Default.is_in_call());
    }
}
