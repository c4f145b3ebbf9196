/// Registration state of this device with the relay's identity service.
///
/// Registration itself happens elsewhere; the link session only consumes the
/// result and refuses to talk to the relay until the id is verified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RegistrationStatus {
    #[default]
    Unregistered,
    Unverified(String),
    Verified(String),
}

impl RegistrationStatus {
    /// The device id, only if the relay has confirmed it.
    pub fn verified_id(&self) -> Option<&str> {
        match self {
            Self::Verified(id) => Some(id),
            Self::Unregistered | Self::Unverified(_) => None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified_id().is_some()
    }
}
