//! VLESS/REALITY link assembly. Pure string building from configuration
//! plus the issued identity; the core treats the parameters as opaque.

use anyhow::anyhow;

use crate::config::LinkSettings;
use crate::error::AgentError;

/// Assemble the `vless://` link for an issued client.
///
/// # Errors
///
/// Fails when the deployment has not configured the public host or the
/// REALITY parameters; nothing can be guessed here.
pub fn build_vless_link(
    uuid: &str,
    email: &str,
    flow: &str,
    link: &LinkSettings,
) -> Result<String, AgentError> {
    let (Some(host), Some(sni), Some(pbk), Some(sid)) = (
        link.public_host.as_deref(),
        link.sni.as_deref(),
        link.public_key.as_deref(),
        link.short_id.as_deref(),
    ) else {
        return Err(AgentError::Internal(anyhow!(
            "missing link params in config (PUBLIC_HOST/REALITY_*)"
        )));
    };

    let port = link.public_port.unwrap_or(443);
    let fingerprint = link.fingerprint.as_deref().unwrap_or("chrome");

    Ok(format!(
        "vless://{uuid}@{host}:{port}\
         ?encryption=none\
         &flow={flow}\
         &security=reality\
         &sni={sni}\
         &fp={fingerprint}\
         &pbk={pbk}\
         &sid={sid}\
         &type=tcp\
         #VPN-{email}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_settings() -> LinkSettings {
        LinkSettings {
            public_host: Some("vpn.example.com".to_string()),
            public_port: Some(443),
            sni: Some("www.example.org".to_string()),
            fingerprint: Some("chrome".to_string()),
            public_key: Some("pbk-value".to_string()),
            short_id: Some("ab12".to_string()),
            default_flow: Some("xtls-rprx-vision".to_string()),
        }
    }

    #[test]
    fn test_full_link() {
        let link = build_vless_link(
            "3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c",
            "123456",
            "xtls-rprx-vision",
            &link_settings(),
        )
        .unwrap();

        assert_eq!(
            link,
            "vless://3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c@vpn.example.com:443\
             ?encryption=none&flow=xtls-rprx-vision&security=reality\
             &sni=www.example.org&fp=chrome&pbk=pbk-value&sid=ab12&type=tcp#VPN-123456"
        );
        assert!(link.starts_with("vless://"));
    }

    #[test]
    fn test_missing_params_is_config_error() {
        let mut settings = link_settings();
        settings.public_key = None;
        let err = build_vless_link("u", "e", "", &settings).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_port_and_fingerprint_defaults() {
        let mut settings = link_settings();
        settings.public_port = None;
        settings.fingerprint = None;
        let link = build_vless_link("u", "e", "", &settings).unwrap();
        assert!(link.contains("@vpn.example.com:443?"));
        assert!(link.contains("&fp=chrome&"));
    }
}
