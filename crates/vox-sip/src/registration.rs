//! Registration state machine and account construction.
//!
//! Per extension: UNREGISTERED → REGISTERING → REGISTERED | FAILED, driven
//! by stack callbacks. The device row's persisted status follows the
//! machine; only the controller writes it.

use vox_core::config::{SipConfig, SIP_REG_REFRESH_SECS};
use vox_core::types::DeviceStatus;
use vox_db::types::SipDevice;

use crate::stack::AccountConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl RegState {
    /// Apply a registration callback.
    pub fn on_callback(self, registered: bool, status_code: u16) -> RegState {
        if registered {
            RegState::Registered
        } else if status_code >= 300 {
            RegState::Failed
        } else {
            // interim / unregister-in-progress responses keep us registering
            RegState::Registering
        }
    }

    /// Status persisted on the device row for this state.
    pub fn device_status(self) -> DeviceStatus {
        match self {
            RegState::Registered => DeviceStatus::Registered,
            RegState::Failed => DeviceStatus::Failed,
            RegState::Unregistered | RegState::Registering => DeviceStatus::Offline,
        }
    }
}

/// Build the stack account for a device row. `slot` picks the local port
/// offset so concurrent extensions don't collide.
pub fn account_config_for(device: &SipDevice, sip: &SipConfig, slot: u16) -> AccountConfig {
    AccountConfig {
        id_uri: match &device.display_name {
            Some(name) => format!("\"{}\" <sip:{}@{}>", name, device.username, device.server),
            None => format!("sip:{}@{}", device.username, device.server),
        },
        registrar_uri: format!("sip:{}:{}", device.server, device.port),
        username: device.username.clone(),
        password: device.password.clone(),
        // wildcard auth realm when none configured
        realm: device.realm.clone().unwrap_or_else(|| "*".to_string()),
        outbound_proxy: device.outbound_proxy.clone(),
        reg_interval_secs: SIP_REG_REFRESH_SECS,
        local_port: sip.port_base + slot,
        user_agent: sip.user_agent.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::types::{AgentConfigId, ExtensionId};

    fn device() -> SipDevice {
        SipDevice {
            id: ExtensionId::from("ext-42"),
            agent_config_id: AgentConfigId::from("a1"),
            server: "pbx.example.com".into(),
            username: "4242".into(),
            password: "secret".into(),
            port: 5060,
            transport: "udp".into(),
            display_name: None,
            realm: None,
            outbound_proxy: None,
            greeting_text: None,
            status: DeviceStatus::Offline,
            last_error: None,
            registered_at: None,
            updated_at: String::new(),
        }
    }

    #[test]
    fn machine_reaches_registered() {
        let state = RegState::Registering.on_callback(true, 200);
        assert_eq!(state, RegState::Registered);
        assert_eq!(state.device_status(), DeviceStatus::Registered);
    }

    #[test]
    fn machine_fails_on_4xx() {
        let state = RegState::Registering.on_callback(false, 403);
        assert_eq!(state, RegState::Failed);
        assert_eq!(state.device_status(), DeviceStatus::Failed);
    }

    #[test]
    fn interim_responses_keep_registering() {
        let state = RegState::Registering.on_callback(false, 100);
        assert_eq!(state, RegState::Registering);
        assert_eq!(state.device_status(), DeviceStatus::Offline);
    }

    #[test]
    fn account_uses_wildcard_realm_when_unset() {
        let cfg = account_config_for(&device(), &SipConfig::default(), 3);
        assert_eq!(cfg.id_uri, "sip:4242@pbx.example.com");
        assert_eq!(cfg.registrar_uri, "sip:pbx.example.com:5060");
        assert_eq!(cfg.realm, "*");
        assert_eq!(cfg.reg_interval_secs, 300);
        assert_eq!(cfg.local_port, SipConfig::default().port_base + 3);
    }

    #[test]
    fn display_name_goes_into_the_identity() {
        let mut d = device();
        d.display_name = Some("Support Desk".into());
        d.realm = Some("pbx".into());
        let cfg = account_config_for(&d, &SipConfig::default(), 0);
        assert_eq!(cfg.id_uri, "\"Support Desk\" <sip:4242@pbx.example.com>");
        assert_eq!(cfg.realm, "pbx");
    }
}
