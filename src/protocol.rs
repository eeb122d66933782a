use crate::{
    codec::{bytes_to_hex, hex_to_bytes},
    error::{Result, SaberError},
    radio::{CharacteristicTarget, ServiceMap},
    types::{AdvertisedState, Platform},
};
use bytes::{BufMut, Bytes, BytesMut};

/// Power characteristic value for "off"
pub const POWER_OFF: u8 = 0x00;

/// Power characteristic value for "on"
pub const POWER_ON: u8 = 0x01;

/// Length of a `#rrggbb` colour string
pub const COLOR_STRING_LEN: usize = 7;

/// Per-platform constants of the saber stand firmware
///
/// The stand exposes a single custom service. CoreBluetooth reports it
/// first and lists only its own characteristics (colour, then power).
/// Android also enumerates the generic access and attribute services, so
/// the same characteristics land further down the flattened list.
///
/// Manufacturer data is framed differently as well: CoreBluetooth hands
/// out the raw AD structure including the little-endian company
/// identifier, Android strips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    /// Index of the stand service in the retrieved service list
    pub service_index: usize,
    /// Index of the power characteristic in the retrieved characteristic list
    pub power_characteristic_index: usize,
    /// Index of the colour characteristic in the retrieved characteristic list
    pub color_characteristic_index: usize,
    /// Offset of the power byte in manufacturer data
    pub power_offset: usize,
    /// Offset of the red byte in manufacturer data
    pub red_offset: usize,
    /// Offset of the green byte in manufacturer data
    pub green_offset: usize,
    /// Offset of the blue byte in manufacturer data
    pub blue_offset: usize,
}

const IOS_PROFILE: PlatformProfile = PlatformProfile {
    service_index: 0,
    power_characteristic_index: 1,
    color_characteristic_index: 0,
    power_offset: 2,
    red_offset: 3,
    green_offset: 4,
    blue_offset: 5,
};

const ANDROID_PROFILE: PlatformProfile = PlatformProfile {
    service_index: 2,
    power_characteristic_index: 5,
    color_characteristic_index: 4,
    power_offset: 0,
    red_offset: 1,
    green_offset: 2,
    blue_offset: 3,
};

impl PlatformProfile {
    /// Look up the profile of a platform family
    #[must_use]
    pub const fn for_platform(platform: Platform) -> &'static Self {
        match platform {
            Platform::Ios => &IOS_PROFILE,
            Platform::Android => &ANDROID_PROFILE,
        }
    }

    /// Minimum manufacturer data length covering every offset
    #[must_use]
    pub fn required_advertisement_len(&self) -> usize {
        [
            self.power_offset,
            self.red_offset,
            self.green_offset,
            self.blue_offset,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
            + 1
    }

    /// Resolve the power characteristic in a retrieved service map
    ///
    /// # Errors
    ///
    /// Returns [`SaberError::MissingCharacteristic`] if the map is shorter
    /// than the profile's indices.
    pub fn power_target(&self, services: &ServiceMap) -> Result<CharacteristicTarget> {
        services.target(self.service_index, self.power_characteristic_index)
    }

    /// Resolve the colour characteristic in a retrieved service map
    ///
    /// # Errors
    ///
    /// Returns [`SaberError::MissingCharacteristic`] if the map is shorter
    /// than the profile's indices.
    pub fn color_target(&self, services: &ServiceMap) -> Result<CharacteristicTarget> {
        services.target(self.service_index, self.color_characteristic_index)
    }
}

/// Parse the stand state out of advertised manufacturer data
///
/// Layout (offsets per [`PlatformProfile`]):
/// - power byte: `0` means off, anything else on
/// - red, green, blue bytes: rendered as `#rrggbb`
///
/// # Errors
///
/// Returns [`SaberError::MalformedAdvertisement`] if the data is absent or
/// too short for the platform's offsets.
pub fn parse_advertisement(data: Option<&[u8]>, platform: Platform) -> Result<AdvertisedState> {
    let data = data.ok_or_else(|| {
        SaberError::MalformedAdvertisement("no manufacturer data".to_string())
    })?;

    let profile = PlatformProfile::for_platform(platform);
    let required = profile.required_advertisement_len();
    if data.len() < required {
        return Err(SaberError::MalformedAdvertisement(format!(
            "manufacturer data too short: {} bytes, expected {required}",
            data.len()
        )));
    }

    let power = data[profile.power_offset] != 0;
    let rgb = [
        data[profile.red_offset],
        data[profile.green_offset],
        data[profile.blue_offset],
    ];

    Ok(AdvertisedState {
        power,
        color: format!("#{}", bytes_to_hex(&rgb)),
    })
}

/// Frame manufacturer data the way the platform's radio stack reports it
///
/// Used by radio backends that receive the company identifier separately.
#[must_use]
pub fn frame_manufacturer_data(platform: Platform, company_id: u16, payload: &[u8]) -> Vec<u8> {
    match platform {
        Platform::Ios => {
            let mut buf = BytesMut::with_capacity(payload.len() + 2);
            buf.put_u16_le(company_id);
            buf.extend_from_slice(payload);
            buf.to_vec()
        }
        Platform::Android => payload.to_vec(),
    }
}

/// Check a colour string against `#rrggbb` (case-insensitive)
#[must_use]
pub fn is_valid_color(color: &str) -> bool {
    parse_color(color).is_ok()
}

/// Parse a `#rrggbb` colour string into its RGB bytes
///
/// # Errors
///
/// Returns [`SaberError::InvalidColor`] if the `#` is missing, the length
/// is not seven characters, or a digit is not hex.
pub fn parse_color(color: &str) -> Result<[u8; 3]> {
    let invalid = || SaberError::InvalidColor(color.to_string());

    if color.len() != COLOR_STRING_LEN {
        return Err(invalid());
    }
    let digits = color.strip_prefix('#').ok_or_else(invalid)?;
    let bytes = hex_to_bytes(digits).map_err(|_| invalid())?;

    <[u8; 3]>::try_from(bytes.as_slice()).map_err(|_| invalid())
}

/// Canonical lowercase form of a valid colour string
///
/// # Errors
///
/// Returns [`SaberError::InvalidColor`] for strings rejected by [`parse_color`].
pub fn normalize_color(color: &str) -> Result<String> {
    let rgb = parse_color(color)?;
    Ok(format!("#{}", bytes_to_hex(&rgb)))
}

/// Build the power characteristic payload
#[must_use]
pub fn power_payload(on: bool) -> Bytes {
    Bytes::from_static(if on { &[POWER_ON] } else { &[POWER_OFF] })
}

/// Decode a power characteristic value read from the stand
///
/// # Errors
///
/// Returns [`SaberError::ReadFailed`] for an empty value.
pub fn parse_power(value: &[u8]) -> Result<bool> {
    value
        .first()
        .map(|&byte| byte != POWER_OFF)
        .ok_or_else(|| SaberError::ReadFailed("empty power value".to_string()))
}

/// Build the colour characteristic payload
///
/// # Errors
///
/// Returns [`SaberError::InvalidColor`] for strings rejected by [`parse_color`].
pub fn color_payload(color: &str) -> Result<Bytes> {
    let rgb = parse_color(color)?;
    Ok(Bytes::copy_from_slice(&rgb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::CharacteristicRef;
    use uuid::Uuid;

    #[test]
    fn test_parse_advertisement_android() {
        let state = parse_advertisement(Some(&[0x01, 0xff, 0x08, 0x00]), Platform::Android).unwrap();
        assert!(state.power);
        assert_eq!(state.color, "#ff0800");

        let state = parse_advertisement(Some(&[0x00, 0x1a, 0x2b, 0x3c, 0x99]), Platform::Android)
            .unwrap();
        assert!(!state.power);
        assert_eq!(state.color, "#1a2b3c");
    }

    #[test]
    fn test_parse_advertisement_ios_skips_company_id() {
        let data = [0x59, 0x00, 0x7f, 0x00, 0x00, 0xff];
        let state = parse_advertisement(Some(&data), Platform::Ios).unwrap();
        assert!(state.power);
        assert_eq!(state.color, "#0000ff");
    }

    #[test]
    fn test_parse_advertisement_is_deterministic() {
        let data = [0x02, 0x10, 0x20, 0x30];
        let first = parse_advertisement(Some(&data), Platform::Android).unwrap();
        let second = parse_advertisement(Some(&data), Platform::Android).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_advertisement_malformed() {
        assert!(matches!(
            parse_advertisement(None, Platform::Android),
            Err(SaberError::MalformedAdvertisement(_))
        ));
        assert!(matches!(
            parse_advertisement(Some(&[0x01, 0x02, 0x03]), Platform::Android),
            Err(SaberError::MalformedAdvertisement(_))
        ));
        assert!(matches!(
            parse_advertisement(Some(&[0x01, 0x02, 0x03, 0x04]), Platform::Ios),
            Err(SaberError::MalformedAdvertisement(_))
        ));
    }

    #[test]
    fn test_frame_manufacturer_data() {
        let payload = [0x01, 0xaa, 0xbb, 0xcc];
        let framed = frame_manufacturer_data(Platform::Ios, 0x0059, &payload);
        assert_eq!(framed, vec![0x59, 0x00, 0x01, 0xaa, 0xbb, 0xcc]);

        let state = parse_advertisement(Some(&framed), Platform::Ios).unwrap();
        let unframed = frame_manufacturer_data(Platform::Android, 0x0059, &payload);
        assert_eq!(state, parse_advertisement(Some(&unframed), Platform::Android).unwrap());
    }

    #[test]
    fn test_color_validation() {
        assert!(is_valid_color("#1a2b3c"));
        assert!(is_valid_color("#1A2B3C"));

        let invalid = vec![
            "1a2b3c",   // missing '#'
            "#1a2b3",   // short
            "#1a2b3g",  // invalid digit
            "#1a2b3c4", // long
            "",
            "##1a2b3",
        ];
        for color in invalid {
            assert!(!is_valid_color(color), "color should be rejected: {color:?}");
        }
    }

    #[test]
    fn test_color_payload() {
        assert_eq!(color_payload("#1a2b3c").unwrap().as_ref(), &[0x1a, 0x2b, 0x3c]);
        assert_eq!(normalize_color("#FFaa00").unwrap(), "#ffaa00");
        assert!(color_payload("#zzzzzz").is_err());
    }

    #[test]
    fn test_power_payload_and_parse() {
        assert_eq!(power_payload(true).as_ref(), &[POWER_ON]);
        assert_eq!(power_payload(false).as_ref(), &[POWER_OFF]);
        assert!(parse_power(&[0x01]).unwrap());
        assert!(!parse_power(&[0x00]).unwrap());
        assert!(parse_power(&[]).is_err());
    }

    #[test]
    fn test_profile_targets() {
        let service = Uuid::from_u128(0x4a);
        let characteristics = (0..6)
            .map(|i| CharacteristicRef {
                service,
                characteristic: Uuid::from_u128(0x100 + i),
            })
            .collect();
        let map = ServiceMap {
            services: vec![Uuid::from_u128(0x1800), Uuid::from_u128(0x1801), service],
            characteristics,
        };

        let android = PlatformProfile::for_platform(Platform::Android);
        let power = android.power_target(&map).unwrap();
        assert_eq!(power.service, service);
        assert_eq!(power.characteristic, Uuid::from_u128(0x105));
        assert_eq!(
            android.color_target(&map).unwrap().characteristic,
            Uuid::from_u128(0x104)
        );

        let short = ServiceMap {
            services: vec![service],
            characteristics: Vec::new(),
        };
        assert!(matches!(
            android.power_target(&short),
            Err(SaberError::MissingCharacteristic { .. })
        ));
    }
}
