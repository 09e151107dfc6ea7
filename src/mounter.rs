//! Developer disk image mounting
//!
//! Before iOS 17 the developer services (location simulation among them) live on
//! a disk image that has to be uploaded to the device and mounted. The image and
//! its signature ship with Xcode, one pair per iOS version.

use tracing::{debug, error, warn};

use crate::{
    LocsimError, ProtocolError, ServiceChannel, ServiceSession,
    action::ActionOutcome,
    variant::{FromVariant, field},
};

/// An image to upload and mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Mount type, "Developer" for developer disk images
    pub image_type: String,
    /// The raw disk image
    pub image: Vec<u8>,
    /// The image's signature
    pub signature: Vec<u8>,
}

impl MountRequest {
    pub const DEVELOPER: &'static str = "Developer";

    /// A developer disk image and its `.signature` file
    pub fn developer(image: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            image_type: Self::DEVELOPER.to_string(),
            image,
            signature,
        }
    }
}

/// What the device said about a mount that got as far as `MountImage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountResult {
    pub success: bool,
    pub message: Option<String>,
}

/// Client for `com.apple.mobile.mobile_image_mounter`
#[derive(Debug)]
pub struct DiskImageMounter<'s> {
    channel: ServiceChannel<'s>,
}

impl<'s> DiskImageMounter<'s> {
    pub const SERVICE_NAME: &'static str = "com.apple.mobile.mobile_image_mounter";
    /// Where uploaded images are staged before mounting
    pub const STAGING_PATH: &'static str = "/private/var/mobile/Media/PublicStaging/staging.dimage";

    /// Starts the image mounter service
    pub async fn start(session: &'s mut ServiceSession) -> Result<Self, LocsimError> {
        let channel = session.start_service(Self::SERVICE_NAME).await?;
        Ok(Self { channel })
    }

    /// Checks whether an image of `image_type` is mounted
    ///
    /// # Errors
    /// `Protocol` if the answer has neither a signature list nor `ImagePresent`
    pub async fn is_mounted(&mut self, image_type: &str) -> Result<bool, LocsimError> {
        let conn = self.channel.connection();

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "LookupImage".into());
        req.insert("ImageType".into(), image_type.into());
        conn.send_plist(req.into()).await?;

        let res = conn.read_response().await?;
        match res.get("ImageSignature") {
            Some(plist::Value::Array(signatures)) => Ok(!signatures.is_empty()),
            // iOS 13 and earlier answer with the one signature
            Some(signature) => Ok(!Vec::<u8>::from_variant(signature)?.is_empty()),
            None => match field::<bool>(&res, "ImagePresent")? {
                Some(present) => Ok(present),
                None => {
                    warn!("LookupImage answer has no signature and no ImagePresent");
                    Err(ProtocolError::MalformedResponse.into())
                }
            },
        }
    }

    /// Uploads and mounts an image
    ///
    /// # Errors
    /// * `AlreadyMounted` if an image of that type is mounted already
    /// * `UploadFailed` if the device refuses or doesn't acknowledge the upload
    /// * `ValidationFailed` if the device reports an error mounting the image
    pub async fn mount(&mut self, request: &MountRequest) -> Result<MountResult, LocsimError> {
        if self.is_mounted(&request.image_type).await? {
            return Err(LocsimError::AlreadyMounted);
        }

        self.upload(request).await?;
        self.mount_uploaded(request).await
    }

    async fn upload(&mut self, request: &MountRequest) -> Result<(), LocsimError> {
        let conn = self.channel.connection();
        let image_size = request.image.len() as u64;

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ReceiveBytes".into());
        req.insert("ImageType".into(), request.image_type.clone().into());
        req.insert("ImageSize".into(), image_size.into());
        req.insert(
            "ImageSignature".into(),
            plist::Value::Data(request.signature.clone()),
        );
        conn.send_plist(req.into()).await?;
        expect_status(conn.read_plist().await?, "ReceiveBytesAck")?;

        debug!("Sending {image_size} image bytes");
        conn.send_raw(&request.image).await?;
        expect_status(conn.read_plist().await?, "Complete")
    }

    async fn mount_uploaded(
        &mut self,
        request: &MountRequest,
    ) -> Result<MountResult, LocsimError> {
        let conn = self.channel.connection();

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "MountImage".into());
        req.insert("ImagePath".into(), Self::STAGING_PATH.into());
        req.insert("ImageType".into(), request.image_type.clone().into());
        req.insert(
            "ImageSignature".into(),
            plist::Value::Data(request.signature.clone()),
        );
        conn.send_plist(req.into()).await?;

        let res = conn.read_plist().await?;
        if field::<String>(&res, "Status")?.as_deref() == Some("Complete") {
            return Ok(MountResult {
                success: true,
                message: None,
            });
        }

        let detail = field::<String>(&res, "DetailedError")?;
        match ActionOutcome::from_response(&res)? {
            ActionOutcome::Succeeded => Ok(MountResult {
                success: true,
                message: detail,
            }),
            ActionOutcome::Rejected => Ok(MountResult {
                success: false,
                message: detail,
            }),
            ActionOutcome::Failed(e) => {
                let detail = detail.unwrap_or(e);
                error!("Mounting failed: {detail}");
                if detail.contains("already mounted") {
                    Err(LocsimError::AlreadyMounted)
                } else {
                    Err(LocsimError::ValidationFailed(detail))
                }
            }
        }
    }

    /// Tells the service the conversation is over
    pub async fn hangup(mut self) -> Result<(), LocsimError> {
        let conn = self.channel.connection();
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Hangup".into());
        conn.send_plist(req.into()).await?;
        Ok(())
    }
}

/// Checks an upload step answered `Status: expected`
fn expect_status(res: plist::Dictionary, expected: &str) -> Result<(), LocsimError> {
    if let Some(e) = field::<String>(&res, "Error")? {
        let detail = field::<String>(&res, "DetailedError")?.unwrap_or(e);
        return Err(LocsimError::UploadFailed(detail));
    }
    match field::<String>(&res, "Status")? {
        Some(status) if status == expected => Ok(()),
        Some(status) => {
            error!("Expected {expected}, device answered {status}");
            Err(LocsimError::UploadFailed(format!("unexpected status {status}")))
        }
        None => Err(ProtocolError::MissingField("Status").into()),
    }
}
