use serde::{Deserialize, Serialize};

use crate::KeyError;

/// Pitch class names, sharps only. Index is semitones above C.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Quality suffix of a key tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyQuality {
    Major,
    Minor,
}

/// A parsed musical key, e.g. `"Fm"`, `"C#"`, `"Bbmaj"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MusicalKey {
    /// Pitch class, 0 = C.
    pub root: u8,
    pub quality: KeyQuality,
}

impl MusicalKey {
    pub fn parse(tag: &str) -> Result<Self, KeyError> {
        let tag = tag.trim();
        let mut chars = tag.chars();
        let letter = chars.next().ok_or_else(|| KeyError::Invalid(tag.to_string()))?;

        let natural: i32 = match letter.to_ascii_uppercase() {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(KeyError::Invalid(tag.to_string())),
        };

        let rest = chars.as_str();
        let (shift, suffix) = if let Some(s) = rest.strip_prefix('#') {
            (1, s)
        } else if let Some(s) = rest.strip_prefix('b') {
            (-1, s)
        } else {
            (0, rest)
        };

        let quality = match suffix {
            "" | "maj" | "M" | "major" => KeyQuality::Major,
            "m" | "min" | "minor" => KeyQuality::Minor,
            _ => return Err(KeyError::Invalid(tag.to_string())),
        };

        Ok(Self {
            root: (natural + shift).rem_euclid(12) as u8,
            quality,
        })
    }

    pub fn name(&self) -> String {
        let root = NOTE_NAMES[self.root as usize % 12];
        match self.quality {
            KeyQuality::Major => root.to_string(),
            KeyQuality::Minor => format!("{root}m"),
        }
    }
}

/// Shortest signed distance in semitones that moves `from` onto `to`.
///
/// The result is always in `-6..=6`; the quality of either key is ignored,
/// only the roots are compared.
pub fn semitone_shift(from: &str, to: &str) -> Result<i32, KeyError> {
    if from == to {
        return Ok(0);
    }
    let from = MusicalKey::parse(from)?;
    let to = MusicalKey::parse(to)?;

    let mut diff = to.root as i32 - from.root as i32;
    if diff.abs() > 6 {
        diff -= 12 * diff.signum();
    }
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sharps_flats_and_quality() {
        assert_eq!(MusicalKey::parse("C").unwrap().root, 0);
        assert_eq!(MusicalKey::parse("C#").unwrap().root, 1);
        assert_eq!(MusicalKey::parse("Bb").unwrap().root, 10);
        assert_eq!(MusicalKey::parse("Cb").unwrap().root, 11);

        let fm = MusicalKey::parse("Fm").unwrap();
        assert_eq!(fm.root, 5);
        assert_eq!(fm.quality, KeyQuality::Minor);
        assert_eq!(fm.name(), "Fm");

        assert_eq!(MusicalKey::parse("Amaj").unwrap().quality, KeyQuality::Major);
    }

    #[test]
    fn rejects_garbage() {
        assert!(MusicalKey::parse("").is_err());
        assert!(MusicalKey::parse("H").is_err());
        assert!(MusicalKey::parse("Cdorian").is_err());
    }

    #[test]
    fn shift_takes_the_short_way_round() {
        assert_eq!(semitone_shift("C", "D").unwrap(), 2);
        assert_eq!(semitone_shift("D", "C").unwrap(), -2);
        // C -> B is 11 up, but 1 down is shorter
        assert_eq!(semitone_shift("C", "B").unwrap(), -1);
        assert_eq!(semitone_shift("B", "C").unwrap(), 1);
        assert_eq!(semitone_shift("Fm", "Am").unwrap(), 4);
        assert_eq!(semitone_shift("Gm", "Gm").unwrap(), 0);
        // minor/major of the same root do not move
        assert_eq!(semitone_shift("A", "Am").unwrap(), 0);
    }

    #[test]
    fn shift_stays_within_a_tritone() {
        for a in NOTE_NAMES {
            for b in NOTE_NAMES {
                let d = semitone_shift(a, b).unwrap();
                assert!((-6..=6).contains(&d), "{a}->{b} = {d}");
            }
        }
    }
}
