// The launch descriptor handed over by the RTSP front-end, plus the client
// permission mask it carries. Immutable once the handshake completes.

use byteorder::{BigEndian, ByteOrder};
use lumen_crypto::GcmCipher;
use uuid::Uuid;

/// Client permission bitmask. Grouped by byte: inputs, operations, actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);

    pub const INPUT_CONTROLLER: Permissions = Permissions(1 << 8);
    pub const INPUT_TOUCH: Permissions = Permissions(1 << 9);
    pub const INPUT_PEN: Permissions = Permissions(1 << 10);
    pub const INPUT_MOUSE: Permissions = Permissions(1 << 11);
    pub const INPUT_KBD: Permissions = Permissions(1 << 12);
    pub const ALL_INPUTS: Permissions = Permissions(0x1f << 8);

    pub const CLIPBOARD_SET: Permissions = Permissions(1 << 16);
    pub const CLIPBOARD_READ: Permissions = Permissions(1 << 17);
    pub const FILE_UPLOAD: Permissions = Permissions(1 << 18);
    pub const FILE_DOWNLOAD: Permissions = Permissions(1 << 19);
    pub const SERVER_CMD: Permissions = Permissions(1 << 20);

    pub const LIST: Permissions = Permissions(1 << 24);
    pub const VIEW: Permissions = Permissions(1 << 25);
    pub const LAUNCH: Permissions = Permissions(1 << 26);

    pub const DEFAULT: Permissions = Permissions(Self::VIEW.0 | Self::LIST.0);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Permissions) -> bool {
        self.0 & other.0 != 0
    }

    /// A client that loses both view and launch must be disconnected on the
    /// next permission update.
    pub fn allows_view(self) -> bool {
        self.intersects(Permissions(Self::VIEW.0 | Self::LAUNCH.0))
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

/// Client request for the adaptive bitrate loop. Zero bounds mean "not
/// set": the minimum falls back to server config and the maximum to the
/// requested stream bitrate.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoBitrateRequest {
    pub enabled: bool,
    pub min_kbps: i32,
    pub max_kbps: i32,
}

/// Everything the streaming core needs from a completed RTSP handshake.
pub struct LaunchDescriptor {
    pub id: u32,

    pub gcm_key: [u8; 16],
    pub iv: [u8; 16],

    /// Opaque payload the client echoes in its first AV ping so the hub can
    /// bind UDP endpoints to this session.
    pub ping_payload: String,
    pub control_connect_data: u32,

    pub device_name: String,
    pub device_uuid: String,
    pub permissions: Permissions,

    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub surround_info: i32,

    pub hdr_enabled: bool,
    pub sops_enabled: bool,
    pub input_only: bool,
    pub host_audio: bool,

    pub auto_bitrate: AutoBitrateRequest,

    /// Post-handshake RTSP encryption context, held for the external RTSP
    /// layer's lifetime.
    pub rtsp_cipher: Option<GcmCipher>,
}

impl LaunchDescriptor {
    /// Remote-input key id: big-endian first four bytes of the launch IV,
    /// mixed into every audio CBC IV.
    pub fn av_ri_key_id(&self) -> u32 {
        BigEndian::read_u32(&self.iv[..4])
    }

    /// Stable session identity derived from the launch id and the client
    /// device uuid; the same client relaunching gets the same uuid.
    pub fn session_uuid(&self) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", self.id, self.device_uuid).as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_groups_do_not_overlap() {
        assert!(!Permissions::ALL_INPUTS.intersects(Permissions::VIEW | Permissions::LIST));
        assert!(Permissions::DEFAULT.allows_view());
        assert!((Permissions::LAUNCH | Permissions::LIST).allows_view());
        assert!(!(Permissions::INPUT_MOUSE | Permissions::LIST).allows_view());
        assert!(Permissions::ALL_INPUTS.contains(Permissions::INPUT_PEN));
    }

    #[test]
    fn av_ri_key_id_reads_iv_big_endian() {
        let descriptor = crate::testutil::test_launch();
        let expected = u32::from_be_bytes([
            descriptor.iv[0],
            descriptor.iv[1],
            descriptor.iv[2],
            descriptor.iv[3],
        ]);
        assert_eq!(descriptor.av_ri_key_id(), expected);
    }

    #[test]
    fn session_uuid_is_stable_per_launch_and_device() {
        let a = crate::testutil::test_launch();
        let b = crate::testutil::test_launch();
        assert_eq!(a.session_uuid(), b.session_uuid());

        let mut other = crate::testutil::test_launch();
        other.id += 1;
        assert_ne!(a.session_uuid(), other.session_uuid());
    }
}
