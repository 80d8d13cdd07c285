use uuid::Uuid;

pub const CONTROLLER_PREFIX: &str = "controller-";
pub const SYNTH_PREFIX: &str = "synth-";

/// Role of a client, inferred purely from its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Controller,
    Synth,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Controller => "controller",
            ClientKind::Synth => "synth",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "controller" => Some(ClientKind::Controller),
            "synth" => Some(ClientKind::Synth),
            _ => None,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            ClientKind::Controller => CONTROLLER_PREFIX,
            ClientKind::Synth => SYNTH_PREFIX,
        }
    }
}

pub fn is_controller_id(id: &str) -> bool {
    id.starts_with(CONTROLLER_PREFIX)
}

pub fn is_synth_id(id: &str) -> bool {
    id.starts_with(SYNTH_PREFIX)
}

/// Mint a fresh client id. A full UUID suffix keeps collisions out of the
/// picture even across many instances minting concurrently.
pub fn mint_client_id(kind: ClientKind) -> String {
    format!("{}{}", kind.prefix(), Uuid::new_v4())
}

/// Leadership records key controllers by full client id. Callers that pass a
/// bare session id get the prefix restored here.
pub fn normalize_controller_id(raw: &str) -> String {
    if raw.starts_with(CONTROLLER_PREFIX) {
        raw.to_string()
    } else {
        format!("{}{}", CONTROLLER_PREFIX, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_carry_prefix_and_are_unique() {
        let a = mint_client_id(ClientKind::Synth);
        let b = mint_client_id(ClientKind::Synth);
        assert!(is_synth_id(&a));
        assert!(!is_controller_id(&a));
        assert_ne!(a, b);

        let c = mint_client_id(ClientKind::Controller);
        assert!(is_controller_id(&c));
    }

    #[test]
    fn kind_parses_wire_names() {
        assert_eq!(ClientKind::parse("controller"), Some(ClientKind::Controller));
        assert_eq!(ClientKind::parse("synth"), Some(ClientKind::Synth));
        assert_eq!(ClientKind::parse("observer"), None);
    }

    #[test]
    fn normalization_is_idempotent() {
        assert_eq!(normalize_controller_id("abc"), "controller-abc");
        assert_eq!(normalize_controller_id("controller-abc"), "controller-abc");
    }
}
