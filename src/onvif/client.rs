use chrono::Utc;
use onvif::soap::{self, client::AuthType};
use schema::{self, onvif::Capabilities};
use tracing::debug;
use url::Url;

use crate::dto::PtzTranslation;
use crate::Error;

/// Device information pulled during pairing, mirroring `GetDeviceInfo`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub hardware_id: String,
}

/// A thin ONVIF session, trimmed from the donor's `OnvifCamera` to the
/// operations the hub actually drives: device discovery, best-effort account
/// provisioning, and PTZ.
pub struct OnvifSession {
    devicemgmt: soap::client::Client,
    media: Option<soap::client::Client>,
    ptz: Option<soap::client::Client>,
}

pub struct OnvifSessionBuilder {
    uri: Option<Url>,
    service_path: String,
    username: Option<String>,
    password: Option<String>,
}

impl Default for OnvifSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OnvifSessionBuilder {
    pub fn new() -> Self {
        Self {
            uri: None,
            service_path: "onvif/device_service".to_string(),
            username: None,
            password: None,
        }
    }

    pub fn uri(mut self, uri: &str) -> Result<Self, Error> {
        let base = if uri.starts_with("http") {
            uri.to_string()
        } else {
            format!("http://{uri}")
        };
        self.uri = Some(Url::parse(&base).map_err(|e| Error::Onvif(e.to_string()))?);
        Ok(self)
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub async fn build(self) -> Result<OnvifSession, Error> {
        let creds = match (self.username.as_ref(), self.password.as_ref()) {
            (Some(username), Some(password)) => Some(soap::client::Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let base_uri = self
            .uri
            .as_ref()
            .ok_or_else(|| Error::Onvif("camera address must be specified".to_string()))?;

        let devicemgmt_uri = base_uri
            .join(&self.service_path)
            .map_err(|e| Error::Onvif(e.to_string()))?;

        let devicemgmt = soap::client::ClientBuilder::new(&devicemgmt_uri)
            .credentials(creds.clone())
            .auth_type(AuthType::Any)
            .build();

        let mut session = OnvifSession {
            devicemgmt,
            media: None,
            ptz: None,
        };

        let services = schema::devicemgmt::get_services(&session.devicemgmt, &Default::default())
            .await
            .map_err(|e| Error::Onvif(e.to_string()))?;

        for service in &services.service {
            let service_url =
                Url::parse(&service.x_addr).map_err(|e| Error::Onvif(e.to_string()))?;
            let svc = Some(
                soap::client::ClientBuilder::new(&service_url)
                    .credentials(creds.clone())
                    .auth_type(AuthType::Any)
                    .build(),
            );
            match service.namespace.as_str() {
                "http://www.onvif.org/ver10/media/wsdl" => session.media = svc,
                "http://www.onvif.org/ver20/ptz/wsdl" => session.ptz = svc,
                _ => debug!("unused onvif service: {:?}", service),
            }
        }

        Ok(session)
    }
}

impl OnvifSession {
    pub async fn get_device_info(&self) -> Result<DeviceInfo, Error> {
        let info = schema::devicemgmt::get_device_information(&self.devicemgmt, &Default::default())
            .await
            .map_err(|e| Error::Onvif(e.to_string()))?;

        Ok(DeviceInfo {
            manufacturer: info.manufacturer,
            model: info.model,
            firmware_version: info.firmware_version,
            serial_number: info.serial_number,
            hardware_id: info.hardware_id,
        })
    }

    pub async fn get_capabilities(&self) -> Result<Capabilities, Error> {
        schema::devicemgmt::get_capabilities(&self.devicemgmt, &Default::default())
            .await
            .map(|r| r.capabilities)
            .map_err(|e| Error::Onvif(e.to_string()))
    }

    /// Best-effort device-side account creation. Devices routinely reject a
    /// duplicate username; callers must treat failures here as non-fatal.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<(), Error> {
        schema::devicemgmt::create_users(
            &self.devicemgmt,
            &schema::devicemgmt::CreateUsers {
                user: vec![schema::onvif::User {
                    username: username.to_string(),
                    password: Some(password.to_string()),
                    user_level: schema::onvif::UserLevel::Administrator,
                    extension: None,
                }],
            },
        )
        .await
        .map_err(|e| Error::Onvif(e.to_string()))?;

        Ok(())
    }

    /// Negotiates a fresh PTZ profile token, the device-side analogue of a
    /// PTZ session; the token is what gets cached/persisted as the camera's
    /// PTZ token.
    pub async fn get_ptz_profile(&self) -> Result<String, Error> {
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| Error::Onvif("media service unavailable".to_string()))?;

        let profiles = schema::media::get_profiles(media, &Default::default())
            .await
            .map_err(|e| Error::Onvif(e.to_string()))?;

        profiles
            .profiles
            .first()
            .map(|p| p.token.0.clone())
            .ok_or_else(|| Error::Onvif("camera advertised no media profiles".to_string()))
    }

    /// Issues a `ContinuousMove` PTZ command against a previously resolved
    /// profile token.
    pub async fn move_camera(
        &self,
        profile_token: &str,
        translation: &PtzTranslation,
    ) -> Result<(), Error> {
        let ptz = self
            .ptz
            .as_ref()
            .ok_or_else(|| Error::Onvif("ptz service unavailable".to_string()))?;

        schema::ptz::continuous_move(
            ptz,
            &schema::ptz::ContinuousMove {
                profile_token: schema::onvif::ReferenceToken(profile_token.to_string()),
                velocity: schema::onvif::PtzSpeed {
                    pan_tilt: Some(schema::onvif::Vector2D {
                        x: translation.pan_tilt.x as f32,
                        y: translation.pan_tilt.y as f32,
                        space: None,
                    }),
                    zoom: Some(schema::onvif::Vector1D {
                        x: translation.zoom.x as f32,
                        space: None,
                    }),
                },
                timeout: None,
            },
        )
        .await
        .map_err(|e| Error::Onvif(e.to_string()))?;

        Ok(())
    }
}

/// `true` if the device's fault text signals a stale PTZ token, i.e. contains
/// both `Invalid` and `Token`. Delegates to the crate-wide predicate so the
/// check lives in exactly one place.
pub fn is_invalid_token_error(err: &anyhow::Error) -> bool {
    Error::is_invalid_ptz_token(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_predicate_matches_expected_fault_text() {
        let err = anyhow::anyhow!("ONVIF fault: Invalid PTZ Token supplied");
        assert!(is_invalid_token_error(&err));

        let other = anyhow::anyhow!("connection refused");
        assert!(!is_invalid_token_error(&other));
    }
}
