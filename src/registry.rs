//! Default vendor lineup
//!
//! Order matters: the service picks the first supported engine whose label
//! keywords match the active microphone.

use crate::core::config::Config;
use crate::core::events::VendorEventBus;
use crate::engines::jabra::bridge::ProcessBridge;
use crate::engines::poly::client::HttpSpokesClient;
use crate::engines::sennheiser::socket::WebSocketFactory;
use crate::engines::{JabraHeadset, PolyHeadset, SennheiserHeadset, YealinkHeadset};
use crate::hid::HidApiProvider;
use crate::vendor::{VendorId, VendorImplementation};
use std::sync::Arc;
use std::time::Duration;

/// Build one engine per vendor with the production transports
pub fn build_default_vendors(
    config: &Config,
    bus: &VendorEventBus,
) -> Vec<Arc<dyn VendorImplementation>> {
    let hid = Arc::new(HidApiProvider::new(config.yealink.read_timeout_ms));
    let spokes = Arc::new(HttpSpokesClient::new(
        &config.poly.base_url,
        &config.poly.plugin_name,
        Duration::from_millis(config.poly.connect_timeout_ms),
    ));
    let bridge = Arc::new(ProcessBridge::new(
        config.jabra.host_command.clone(),
        config.jabra.host_args.clone(),
    ));

    vec![
        Arc::new(YealinkHeadset::new(
            config.yealink.clone(),
            hid,
            bus.emitter(VendorId::Yealink),
        )),
        Arc::new(SennheiserHeadset::new(
            config.sennheiser.clone(),
            Arc::new(WebSocketFactory),
            bus.emitter(VendorId::Sennheiser),
        )),
        Arc::new(PolyHeadset::new(
            config.poly.clone(),
            spokes,
            bus.emitter(VendorId::Poly),
        )),
        Arc::new(JabraHeadset::new(
            config.jabra.clone(),
            bridge,
            bus.emitter(VendorId::Jabra),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_lineup_order() {
        let bus = VendorEventBus::new();
        let vendors = build_default_vendors(&Config::default(), &bus);
        let ids: Vec<VendorId> = vendors.iter().map(|v| v.vendor()).collect();
        assert_eq!(
            ids,
            vec![VendorId::Yealink, VendorId::Sennheiser, VendorId::Poly, VendorId::Jabra]
        );
        assert!(vendors.iter().all(|v| !v.state().is_connected));
    }

    #[tokio::test]
    async fn test_label_routing() {
        let bus = VendorEventBus::new();
        let vendors = build_default_vendors(&Config::default(), &bus);
        let owner = |label: &str| {
            vendors
                .iter()
                .find(|v| v.device_label_matches_vendor(label))
                .map(|v| v.vendor())
        };
        assert_eq!(owner("Yealink WH62 Mono"), Some(VendorId::Yealink));
        assert_eq!(owner("Sennheiser SC 660"), Some(VendorId::Sennheiser));
        assert_eq!(owner("Plantronics Blackwire 5220"), Some(VendorId::Poly));
        assert_eq!(owner("Jabra Evolve2 65"), Some(VendorId::Jabra));
        assert_eq!(owner("MacBook Pro Microphone"), None);
    }
}
