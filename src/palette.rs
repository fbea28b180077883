use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    error::Result,
    names,
    registry::{Registry, Section},
};

pub const PALETTE_LEN: usize = 16;
pub const SECTION_LEN: usize = PALETTE_LEN * 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn from_packed(v: u32) -> Self {
        Self {
            r: (v >> 16) as u8,
            g: (v >> 8) as u8,
            b: v as u8,
        }
    }

    pub const fn packed(self) -> u32 {
        rgb(self.r, self.g, self.b)
    }
}

/// Pack a colour as `0x00RRGGBB`.
pub const fn rgb(r: u8, g: u8, b: u8) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

pub const BLACK: usize = 0;
pub const BLUE: usize = 1;
pub const GREEN: usize = 2;
pub const CYAN: usize = 3;
pub const RED: usize = 4;
pub const MAGENTA: usize = 5;
pub const BROWN: usize = 6;
pub const LIGHTGRAY: usize = 7;
pub const DARKGRAY: usize = 8;
pub const LIGHTBLUE: usize = 9;
pub const LIGHTGREEN: usize = 10;
pub const LIGHTCYAN: usize = 11;
pub const LIGHTRED: usize = 12;
pub const LIGHTMAGENTA: usize = 13;
pub const YELLOW: usize = 14;
pub const WHITE: usize = 15;

pub const DEFAULT_PALETTE: [Rgb; PALETTE_LEN] = [
    Rgb::from_packed(0x000000),
    Rgb::from_packed(0x000080),
    Rgb::from_packed(0x008000),
    Rgb::from_packed(0x0080FF),
    Rgb::from_packed(0x800000),
    Rgb::from_packed(0x800080),
    Rgb::from_packed(0x804000),
    Rgb::from_packed(0xC0C0C0),
    Rgb::from_packed(0x808080),
    Rgb::from_packed(0x0000FF),
    Rgb::from_packed(0x00FF00),
    Rgb::from_packed(0x00FFFF),
    Rgb::from_packed(0xC00000),
    Rgb::from_packed(0xFF0080),
    Rgb::from_packed(0xFFFF00),
    Rgb::from_packed(0xFFFFFF),
];

/// The 16-entry colour table both sides see.
#[derive(Clone, Debug)]
pub struct SharedPalette {
    section: Section,
}

impl SharedPalette {
    pub fn create(registry: &dyn Registry) -> Result<Self> {
        let palette = Self {
            section: registry.create_section(names::PALETTE, SECTION_LEN)?,
        };
        palette.reset();
        Ok(palette)
    }

    pub fn open(registry: &dyn Registry) -> Result<Self> {
        let section = registry.open_section(names::PALETTE)?;
        section.require_len(SECTION_LEN)?;
        Ok(Self { section })
    }

    fn entries(&self) -> &[AtomicU32; PALETTE_LEN] {
        unsafe { self.section.view(0) }
    }

    /// Entries past the end of the table read as black.
    pub fn get(&self, index: usize) -> Rgb {
        self.entries()
            .get(index)
            .map(|e| Rgb::from_packed(e.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Returns `false` for an index outside the table.
    pub fn set(&self, index: usize, colour: Rgb) -> bool {
        match self.entries().get(index) {
            Some(entry) => {
                entry.store(colour.packed(), Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> [Rgb; PALETTE_LEN] {
        std::array::from_fn(|i| self.get(i))
    }

    pub fn reset(&self) {
        for (i, colour) in DEFAULT_PALETTE.iter().enumerate() {
            self.set(i, *colour);
        }
    }
}
