//! # Musical Tuning Module
//!
//! Note, frequency and MIDI-number conversions under 12-tone equal
//! temperament referenced to A4 = 440 Hz, plus cent deviation math.
//!
//! ## Features
//! - Pitch-class spelling with sharps, parsing of flat spellings
//! - Note ↔ frequency ↔ MIDI conversions
//! - Nearest-note lookup with residual cents
//! - Transposition through MIDI-number space

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reference pitch for A4 in Hz.
pub const A4_FREQUENCY: f64 = 440.0;

/// MIDI number of A4.
pub const A4_MIDI: i32 = 69;

/// The twelve pitch classes, spelled with sharps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PitchClass {
    C,
    #[serde(rename = "C#")]
    CSharp,
    D,
    #[serde(rename = "D#")]
    DSharp,
    E,
    F,
    #[serde(rename = "F#")]
    FSharp,
    G,
    #[serde(rename = "G#")]
    GSharp,
    A,
    #[serde(rename = "A#")]
    ASharp,
    B,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::CSharp,
        PitchClass::D,
        PitchClass::DSharp,
        PitchClass::E,
        PitchClass::F,
        PitchClass::FSharp,
        PitchClass::G,
        PitchClass::GSharp,
        PitchClass::A,
        PitchClass::ASharp,
        PitchClass::B,
    ];

    /// Semitone index within the octave, C = 0.
    pub fn index(self) -> i32 {
        self as i32
    }

    pub fn from_index(index: i32) -> PitchClass {
        Self::ALL[index.rem_euclid(12) as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            PitchClass::C => "C",
            PitchClass::CSharp => "C#",
            PitchClass::D => "D",
            PitchClass::DSharp => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::FSharp => "F#",
            PitchClass::G => "G",
            PitchClass::GSharp => "G#",
            PitchClass::A => "A",
            PitchClass::ASharp => "A#",
            PitchClass::B => "B",
        }
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepted spellings for every pitch class, flats included.
static SPELLINGS: Lazy<BTreeMap<&'static str, PitchClass>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    for class in PitchClass::ALL {
        map.insert(class.name(), class);
    }
    for (flat, class) in [
        ("Db", PitchClass::CSharp),
        ("Eb", PitchClass::DSharp),
        ("Gb", PitchClass::FSharp),
        ("Ab", PitchClass::GSharp),
        ("Bb", PitchClass::ASharp),
    ] {
        map.insert(flat, class);
    }
    map
});

impl FromStr for PitchClass {
    type Err = ParseNoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SPELLINGS
            .get(s)
            .copied()
            .ok_or_else(|| ParseNoteError(s.to_string()))
    }
}

/// Error returned when a note name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised note name `{0}`")]
pub struct ParseNoteError(String);

/// A single musical note.
///
/// The frequency is always derived from the pitch class and octave, so two
/// notes with the same spelling compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "NoteSpelling", into = "NoteSpelling")]
pub struct Note {
    name: PitchClass,
    octave: i32,
    frequency: f64,
}

#[derive(Serialize, Deserialize)]
struct NoteSpelling {
    name: PitchClass,
    octave: i32,
}

impl From<NoteSpelling> for Note {
    fn from(spelling: NoteSpelling) -> Self {
        Note::new(spelling.name, spelling.octave)
    }
}

impl From<Note> for NoteSpelling {
    fn from(note: Note) -> Self {
        NoteSpelling {
            name: note.name,
            octave: note.octave,
        }
    }
}

impl Note {
    pub fn new(name: PitchClass, octave: i32) -> Self {
        Self {
            name,
            octave,
            frequency: note_to_frequency(name, octave),
        }
    }

    /// Builds the note for a MIDI number (60 = C4). Numbers outside 0..=127
    /// are allowed and simply extend the octave range.
    pub fn from_midi(midi: i32) -> Self {
        let octave = midi.div_euclid(12) - 1;
        Self::new(PitchClass::from_index(midi), octave)
    }

    pub fn name(&self) -> PitchClass {
        self.name
    }

    pub fn octave(&self) -> i32 {
        self.octave
    }

    /// Frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn midi(&self) -> i32 {
        note_to_midi(self.name, self.octave)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.octave)
    }
}

impl FromStr for Note {
    type Err = ParseNoteError;

    /// Parses names such as `A4`, `C#3`, `Bb2` or `C-1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(|c: char| c.is_ascii_digit() || c == '-')
            .ok_or_else(|| ParseNoteError(s.to_string()))?;
        let (class, octave) = s.split_at(split);
        let class = class.parse::<PitchClass>()?;
        let octave = octave
            .parse::<i32>()
            .map_err(|_| ParseNoteError(s.to_string()))?;
        Ok(Note::new(class, octave))
    }
}

/// The nearest equal-tempered note to a measured frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteReading {
    pub midi: i32,
    pub note: Note,
    /// Residual offset from `note` in cents, within ±50.
    pub cents: f64,
}

/// MIDI number for a pitch class and octave.
/// Saturates at the `i32` bounds for absurd octaves.
pub fn note_to_midi(name: PitchClass, octave: i32) -> i32 {
    octave
        .saturating_add(1)
        .saturating_mul(12)
        .saturating_add(name.index())
}

/// Equal-tempered frequency of a note: `440 * 2^(semitonesFromA4 / 12)`.
pub fn note_to_frequency(name: PitchClass, octave: i32) -> f64 {
    let semitones_from_a4 = note_to_midi(name, octave).saturating_sub(A4_MIDI);
    A4_FREQUENCY * 2.0_f64.powf(semitones_from_a4 as f64 / 12.0)
}

/// Finds the nearest note to a frequency.
///
/// Returns `None` for non-finite or non-positive input.
pub fn frequency_to_note(frequency: f64) -> Option<NoteReading> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return None;
    }

    let midi = A4_MIDI as f64 + 12.0 * (frequency / A4_FREQUENCY).log2();
    if !midi.is_finite() {
        return None;
    }

    let nearest = midi.round();
    Some(NoteReading {
        midi: nearest as i32,
        note: Note::from_midi(nearest as i32),
        cents: (midi - nearest) * 100.0,
    })
}

/// Note for a MIDI number, with negative numbers clamped to 0 (C-1).
pub fn midi_to_note(midi: i32) -> Note {
    Note::from_midi(midi.max(0))
}

/// Moves a note by a number of semitones, saturating at the `i32` MIDI
/// bounds.
pub fn transpose(note: &Note, semitones: i32) -> Note {
    Note::from_midi(note.midi().saturating_add(semitones))
}

/// Calculates the deviation from a target frequency in cents.
///
/// Positive values are sharp, negative values flat.
pub fn calculate_cents_deviation(freq: f64, target_freq: f64) -> f64 {
    1200.0 * (freq / target_freq).log2()
}
