//! Conversions between the devices' packed color strings and HSB.
//!
//! Two wire encodings exist in the field:
//!
//! - `HSB`: `hhhhssssbbbb`, hue 0-360 with saturation and brightness on a
//!   0-1000 scale.
//! - `HSBHEX`: `rrggbbhhhhssbb`, an RGB prefix followed by hue and 0-255
//!   saturation/brightness. The prefix is ignored when reading and
//!   recomputed from the HSB triple when writing.

use std::fmt::Write as _;

/// Normalized color: hue 0-359, saturation and brightness 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hsb {
    pub h: u16,
    pub s: u16,
    pub b: u16,
}

impl Hsb {
    /// White at full brightness, used when a wire value cannot be read.
    pub const DEFAULT: Self = Self { h: 0, s: 0, b: 100 };

    pub fn component(&self, c: ColorComponent) -> u16 {
        match c {
            ColorComponent::H => self.h,
            ColorComponent::S => self.s,
            ColorComponent::B => self.b,
        }
    }

    fn set_component(&mut self, c: ColorComponent, value: u16) {
        match c {
            ColorComponent::H => self.h = value.min(360),
            ColorComponent::S => self.s = value.min(100),
            ColorComponent::B => self.b = value.min(100),
        }
    }

    /// Apply a comma separated command such as `"120,50"` to the listed
    /// components. Returns `false` if any value fails to parse; in that
    /// case nothing is changed.
    pub fn apply_components(&mut self, components: &[ColorComponent], command: &str) -> bool {
        let values: Option<Vec<u16>> = command
            .split(',')
            .map(|v| v.trim().parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0))
            .map(|v| v.map(|v| v.round() as u16))
            .collect();
        match values {
            Some(values) if values.len() == components.len() => {
                for (c, v) in components.iter().zip(values) {
                    self.set_component(*c, v);
                }
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorComponent {
    H,
    S,
    B,
}

impl ColorComponent {
    /// Parse a components list such as `"h,s"`.
    pub fn parse_list(list: &str) -> Option<Vec<Self>> {
        list.split(',')
            .map(|c| match c.trim() {
                "h" => Some(Self::H),
                "s" => Some(Self::S),
                "b" => Some(Self::B),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .filter(|l| !l.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Hsb,
    HsbHex,
}

impl ColorFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "hsb" => Some(Self::Hsb),
            "hsbhex" => Some(Self::HsbHex),
            _ => None,
        }
    }

    /// Guess the encoding from a sample value. Bulbs with the 1-5 DPS layout
    /// default to `HSBHEX`, the 20-24 layout defaults to `HSB`.
    pub fn probe(sample: Option<&str>, legacy_layout: bool) -> Self {
        let len = sample.map_or(0, str::len);
        if legacy_layout {
            if len == 12 { Self::Hsb } else { Self::HsbHex }
        } else if len == 14 {
            Self::HsbHex
        } else {
            Self::Hsb
        }
    }

    pub fn decode(self, raw: Option<&str>) -> Hsb {
        let parsed = match self {
            Self::Hsb => raw.and_then(decode_hsb),
            Self::HsbHex => raw.and_then(decode_hsbhex),
        };
        parsed.unwrap_or(Hsb::DEFAULT)
    }

    pub fn encode(self, color: Hsb) -> String {
        match self {
            Self::Hsb => format!(
                "{:04x}{:04x}{:04x}",
                color.h,
                10 * u32::from(color.s),
                10 * u32::from(color.b)
            ),
            Self::HsbHex => {
                let mut out = rgb_hex(color);
                let _ = write!(
                    out,
                    "{:04x}{:02x}{:02x}",
                    color.h,
                    scale_255(color.s),
                    scale_255(color.b)
                );
                out
            }
        }
    }
}

fn hex_field(raw: &str, range: std::ops::Range<usize>) -> Option<u16> {
    u16::from_str_radix(raw.get(range)?, 16).ok()
}

fn decode_hsb(raw: &str) -> Option<Hsb> {
    if raw.len() != 12 {
        return None;
    }
    let (h, s, b) = (
        hex_field(raw, 0..4)?,
        hex_field(raw, 4..8)?,
        hex_field(raw, 8..12)?,
    );
    if h > 360 || s > 1000 || b > 1000 {
        return None;
    }
    Some(Hsb {
        h,
        s: (f64::from(s) / 10.0).round() as u16,
        b: (f64::from(b) / 10.0).round() as u16,
    })
}

fn decode_hsbhex(raw: &str) -> Option<Hsb> {
    if raw.len() != 14 {
        return None;
    }
    let h = hex_field(raw, 6..10)?;
    if h > 360 {
        return None;
    }
    Some(Hsb {
        h,
        s: (f64::from(hex_field(raw, 10..12)?) / 2.55).round() as u16,
        b: (f64::from(hex_field(raw, 12..14)?) / 2.55).round() as u16,
    })
}

fn scale_255(v: u16) -> u16 {
    (2.55 * f64::from(v)).round() as u16
}

/// Standard HSV to RGB, as six-character lowercase hex.
fn rgb_hex(color: Hsb) -> String {
    let h = f64::from(color.h) / 60.0;
    let s = f64::from(color.s) / 100.0;
    let v = f64::from(color.b) * 2.55;

    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match (sector as u32) % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    format!(
        "{:02x}{:02x}{:02x}",
        r.round() as u8,
        g.round() as u8,
        b.round() as u8
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hsb(h: u16, s: u16, b: u16) -> Hsb {
        Hsb { h, s, b }
    }

    #[test]
    fn hsb_encoding() {
        assert_eq!(ColorFormat::Hsb.encode(hsb(120, 50, 100)), "007801f403e8");
        assert_eq!(ColorFormat::Hsb.decode(Some("007801f403e8")), hsb(120, 50, 100));
    }

    #[test]
    fn hsbhex_rgb_prefix_fixtures() {
        assert_eq!(ColorFormat::HsbHex.encode(hsb(0, 100, 100)), "ff00000000ffff");
        assert_eq!(&ColorFormat::HsbHex.encode(hsb(120, 100, 100))[..6], "00ff00");
        assert_eq!(&ColorFormat::HsbHex.encode(hsb(240, 100, 100))[..6], "0000ff");
        assert_eq!(&ColorFormat::HsbHex.encode(hsb(0, 0, 100))[..6], "ffffff");
        assert_eq!(&ColorFormat::HsbHex.encode(hsb(200, 40, 0))[..6], "000000");
    }

    #[test]
    fn round_trips_every_triple() {
        for h in (0..360).step_by(7) {
            for s in (0..=100).step_by(3) {
                for b in (0..=100).step_by(5) {
                    let c = hsb(h, s, b);
                    let via_hsb = ColorFormat::Hsb.decode(Some(&ColorFormat::Hsb.encode(c)));
                    assert_eq!(via_hsb, c);
                    let encoded = ColorFormat::HsbHex.encode(c);
                    assert_eq!(encoded.len(), 14);
                    assert_eq!(ColorFormat::HsbHex.decode(Some(&encoded)), c);
                }
            }
        }
    }

    #[test]
    fn malformed_values_decode_to_white() {
        assert_eq!(ColorFormat::Hsb.decode(None), Hsb::DEFAULT);
        assert_eq!(ColorFormat::Hsb.decode(Some("zzzz")), Hsb::DEFAULT);
        assert_eq!(ColorFormat::HsbHex.decode(Some("ff0000zzzz1234")), Hsb::DEFAULT);
        assert_eq!(ColorFormat::HsbHex.decode(None), Hsb::DEFAULT);
    }

    #[test]
    fn out_of_range_fields_decode_to_white() {
        let c = ColorFormat::Hsb.decode(Some("0000ffffffff"));
        assert_eq!(c, Hsb::DEFAULT);
        assert_eq!(ColorFormat::Hsb.decode(Some("0fff01f403e8")), Hsb::DEFAULT);
        assert_eq!(ColorFormat::HsbHex.decode(Some("ff00000fff6464")), Hsb::DEFAULT);

        let mut c = c;
        assert!(c.apply_components(&[ColorComponent::B], "50"));
        assert_eq!(ColorFormat::Hsb.encode(c), "0000000001f4");
    }

    #[test]
    fn probes_encoding_by_length() {
        assert_eq!(ColorFormat::probe(Some("007801f403e8"), true), ColorFormat::Hsb);
        assert_eq!(ColorFormat::probe(Some("ff00000000ffff"), true), ColorFormat::HsbHex);
        assert_eq!(ColorFormat::probe(None, true), ColorFormat::HsbHex);
        assert_eq!(ColorFormat::probe(Some("ff00000000ffff"), false), ColorFormat::HsbHex);
        assert_eq!(ColorFormat::probe(None, false), ColorFormat::Hsb);
    }

    #[test]
    fn component_commands() {
        let mut c = hsb(10, 20, 30);
        assert!(c.apply_components(&[ColorComponent::H, ColorComponent::S], "200,75.4"));
        assert_eq!(c, hsb(200, 75, 30));
        assert!(!c.apply_components(&[ColorComponent::B], "bright"));
        assert!(!c.apply_components(&[ColorComponent::H, ColorComponent::S], "5"));
        assert_eq!(c, hsb(200, 75, 30));
        assert_eq!(ColorComponent::parse_list("h,s,b").unwrap().len(), 3);
        assert!(ColorComponent::parse_list("h,x").is_none());
    }
}
