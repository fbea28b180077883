//! Off-screen pages living in named sections.
//!
//! Layout: a 64-byte [`PageHeader`] followed by `stride * height` pixel bytes,
//! rows top-down. Indexed pages pack two pixels per byte, left pixel in the
//! high nibble.

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    names,
    palette::Rgb,
    registry::{Registry, Section},
};

const PAGE_MAGIC: u32 = u32::from_le_bytes(*b"BGIP");
const PAGE_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 4-bit palette indices.
    Indexed4,
    /// `0x00RRGGBB`.
    Rgb32,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Indexed4 => 4,
            Self::Rgb32 => 32,
        }
    }

    fn from_bits_per_pixel(bits: u32) -> Option<Self> {
        match bits {
            4 => Some(Self::Indexed4),
            32 => Some(Self::Rgb32),
            _ => None,
        }
    }

    pub fn stride(self, width: u32) -> usize {
        let row_bits = width as usize * self.bits_per_pixel() as usize;
        row_bits.div_ceil(8).next_multiple_of(4)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Geometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn stride(&self) -> usize {
        self.format.stride(self.width)
    }

    pub fn pixels_len(&self) -> usize {
        self.stride() * self.height as usize
    }

    pub fn section_len(&self) -> usize {
        HEADER_LEN + self.pixels_len()
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}bpp",
            self.width,
            self.height,
            self.format.bits_per_pixel()
        )
    }
}

#[repr(C)]
struct PageHeader {
    magic: AtomicU32,
    version: AtomicU32,
    index: AtomicU32,
    width: AtomicU32,
    height: AtomicU32,
    bits_per_pixel: AtomicU32,
    stride: AtomicU32,
    _reserved: [AtomicU32; 9],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == HEADER_LEN);

fn page_name(index: usize) -> Result<&'static str> {
    names::PAGES
        .get(index)
        .copied()
        .ok_or(Error::InvalidPage(index))
}

/// A local handle on one of the two shared pages.
///
/// Each process wraps its own handle around the same bytes; writes through
/// one are visible through the other without a flush.
#[derive(Debug)]
pub struct Page {
    index: usize,
    geometry: Geometry,
    section: Section,
}

impl Page {
    pub fn create(registry: &dyn Registry, index: usize, geometry: Geometry) -> Result<Self> {
        let name = page_name(index)?;
        let section = registry.create_section(name, geometry.section_len())?;
        let page = Self {
            index,
            geometry,
            section,
        };
        let header = page.header();
        header.version.store(PAGE_VERSION, Ordering::Relaxed);
        header.index.store(index as u32, Ordering::Relaxed);
        header.width.store(geometry.width, Ordering::Relaxed);
        header.height.store(geometry.height, Ordering::Relaxed);
        header
            .bits_per_pixel
            .store(geometry.format.bits_per_pixel(), Ordering::Relaxed);
        header
            .stride
            .store(geometry.stride() as u32, Ordering::Relaxed);
        header.magic.store(PAGE_MAGIC, Ordering::Release);
        tracing::debug!(name, %geometry, "created page");
        Ok(page)
    }

    pub fn open(registry: &dyn Registry, index: usize, expected: Geometry) -> Result<Self> {
        let name = page_name(index)?;
        let section = registry.open_section(name)?;
        section.require_len(HEADER_LEN)?;
        let header: &PageHeader = unsafe { section.view(0) };

        let bad = |reason: String| Error::BadHeader {
            name: name.to_string(),
            reason,
        };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != PAGE_MAGIC {
            return Err(bad(format!("bad magic {magic:#010x}")));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != PAGE_VERSION {
            return Err(bad(format!("unsupported version {version}")));
        }
        let stored_index = header.index.load(Ordering::Relaxed);
        if stored_index as usize != index {
            return Err(bad(format!("holds page {stored_index}, not {index}")));
        }
        let bits = header.bits_per_pixel.load(Ordering::Relaxed);
        let format = PixelFormat::from_bits_per_pixel(bits)
            .ok_or_else(|| bad(format!("unknown pixel depth {bits}")))?;
        let actual = Geometry::new(
            header.width.load(Ordering::Relaxed),
            header.height.load(Ordering::Relaxed),
            format,
        );
        if actual != expected {
            return Err(Error::GeometryMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        if header.stride.load(Ordering::Relaxed) as usize != actual.stride() {
            return Err(bad("stride does not match geometry".to_string()));
        }
        section.require_len(actual.section_len())?;

        Ok(Self {
            index,
            geometry: actual,
            section,
        })
    }

    fn header(&self) -> &PageHeader {
        unsafe { self.section.view(0) }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn format(&self) -> PixelFormat {
        self.geometry.format
    }

    pub fn stride(&self) -> usize {
        self.geometry.stride()
    }

    fn pixels_ptr(&self) -> *mut u8 {
        unsafe { self.section.as_ptr().add(HEADER_LEN) }
    }

    /// Raw pixel bytes, for drawing code that wants to blit whole rows.
    pub fn pixels(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.pixels_ptr(), self.geometry.pixels_len()) }
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.pixels_ptr(), self.geometry.pixels_len()) }
    }

    fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width() && (y as u32) < self.height()
    }

    /// Palette index or packed RGB at `(x, y)`; `0` outside the page.
    pub fn get_pixel(&self, x: i32, y: i32) -> u32 {
        if !self.in_bounds(x, y) {
            return 0;
        }
        let (x, y) = (x as usize, y as usize);
        let row = unsafe { self.pixels_ptr().add(y * self.stride()) };
        match self.format() {
            PixelFormat::Indexed4 => {
                let byte = unsafe { row.add(x / 2).read_volatile() };
                if x % 2 == 0 {
                    u32::from(byte >> 4)
                } else {
                    u32::from(byte & 0x0f)
                }
            }
            PixelFormat::Rgb32 => unsafe { (row.add(x * 4) as *const u32).read_volatile() },
        }
    }

    /// Out-of-page writes are ignored.
    pub fn put_pixel(&mut self, x: i32, y: i32, value: u32) {
        if !self.in_bounds(x, y) {
            return;
        }
        let (x, y) = (x as usize, y as usize);
        let row = unsafe { self.pixels_ptr().add(y * self.stride()) };
        match self.format() {
            PixelFormat::Indexed4 => unsafe {
                let cell = row.add(x / 2);
                let nibble = (value & 0x0f) as u8;
                let byte = cell.read_volatile();
                let byte = if x % 2 == 0 {
                    (byte & 0x0f) | (nibble << 4)
                } else {
                    (byte & 0xf0) | nibble
                };
                cell.write_volatile(byte);
            },
            PixelFormat::Rgb32 => unsafe {
                (row.add(x * 4) as *mut u32).write_volatile(value & 0x00ff_ffff);
            },
        }
    }

    pub fn fill(&mut self, value: u32) {
        match self.format() {
            PixelFormat::Indexed4 => {
                let nibble = (value & 0x0f) as u8;
                self.pixels_mut().fill(nibble << 4 | nibble);
            }
            PixelFormat::Rgb32 => {
                let width = self.width() as usize;
                let stride = self.stride();
                let bytes = (value & 0x00ff_ffff).to_ne_bytes();
                for row in self.pixels_mut().chunks_exact_mut(stride) {
                    for px in row[..width * 4].chunks_exact_mut(4) {
                        px.copy_from_slice(&bytes);
                    }
                }
            }
        }
    }

    /// Expand the page into tightly packed RGBA8 rows for presentation.
    pub fn render_rgba(&self, palette: &[Rgb; 16], out: &mut Vec<u8>) {
        let width = self.width() as usize;
        let height = self.height() as usize;
        let stride = self.stride();
        out.resize(width * height * 4, 0);

        let pixels = self.pixels();
        for (y, dst_row) in out.chunks_exact_mut(width * 4).enumerate().take(height) {
            let src_row = &pixels[y * stride..(y + 1) * stride];
            for (x, dst) in dst_row.chunks_exact_mut(4).enumerate() {
                let rgb = match self.format() {
                    PixelFormat::Indexed4 => {
                        let byte = src_row[x / 2];
                        let idx = if x % 2 == 0 { byte >> 4 } else { byte & 0x0f };
                        palette[idx as usize]
                    }
                    PixelFormat::Rgb32 => {
                        let mut px = [0u8; 4];
                        px.copy_from_slice(&src_row[x * 4..x * 4 + 4]);
                        Rgb::from_packed(u32::from_ne_bytes(px))
                    }
                };
                dst.copy_from_slice(&[rgb.r, rgb.g, rgb.b, 0xff]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{palette::DEFAULT_PALETTE, registry::MemoryRegistry};

    const VGA: Geometry = Geometry {
        width: 640,
        height: 480,
        format: PixelFormat::Indexed4,
    };

    #[test]
    fn strides_are_four_byte_aligned() {
        assert_eq!(PixelFormat::Indexed4.stride(640), 320);
        assert_eq!(PixelFormat::Indexed4.stride(3), 4);
        assert_eq!(PixelFormat::Rgb32.stride(3), 12);
        assert_eq!(VGA.section_len(), HEADER_LEN + 320 * 480);
    }

    #[test]
    fn left_pixel_is_the_high_nibble() {
        let registry = MemoryRegistry::new();
        let mut page = Page::create(&registry, 0, VGA).unwrap();
        page.put_pixel(0, 0, 0xA);
        page.put_pixel(1, 0, 0x5);
        assert_eq!(page.pixels()[0], 0xA5);
        assert_eq!(page.get_pixel(0, 0), 0xA);
        assert_eq!(page.get_pixel(1, 0), 0x5);
    }

    #[test]
    fn writes_are_visible_through_another_handle() {
        let registry = MemoryRegistry::new();
        let mut writer = Page::create(&registry, 1, VGA).unwrap();
        let reader = Page::open(&registry, 1, VGA).unwrap();
        writer.put_pixel(639, 479, 14);
        assert_eq!(reader.get_pixel(639, 479), 14);
    }

    #[test]
    fn out_of_page_access_is_harmless() {
        let registry = MemoryRegistry::new();
        let mut page = Page::create(&registry, 0, VGA).unwrap();
        page.put_pixel(-1, 0, 3);
        page.put_pixel(640, 0, 3);
        assert_eq!(page.get_pixel(0, 480), 0);
        assert!(page.pixels().iter().all(|&b| b == 0));
    }

    #[test]
    fn open_rejects_other_geometry() {
        let registry = MemoryRegistry::new();
        let _page = Page::create(&registry, 0, VGA).unwrap();
        let wanted = Geometry::new(800, 600, PixelFormat::Indexed4);
        match Page::open(&registry, 0, wanted) {
            Err(Error::GeometryMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, wanted);
                assert_eq!(actual, VGA);
            }
            other => panic!("expected geometry mismatch, got {other:?}"),
        }
    }

    #[test]
    fn open_rejects_foreign_bytes() {
        let registry = MemoryRegistry::new();
        registry
            .create_section(names::PAGES[0], VGA.section_len())
            .unwrap();
        assert!(matches!(
            Page::open(&registry, 0, VGA),
            Err(Error::BadHeader { .. })
        ));
    }

    #[test]
    fn third_page_is_invalid() {
        let registry = MemoryRegistry::new();
        assert!(matches!(
            Page::create(&registry, 2, VGA),
            Err(Error::InvalidPage(2))
        ));
    }

    #[test]
    fn renders_through_the_palette() {
        let registry = MemoryRegistry::new();
        let geometry = Geometry::new(2, 1, PixelFormat::Indexed4);
        let mut page = Page::create(&registry, 0, geometry).unwrap();
        page.put_pixel(1, 0, 15);
        let mut rgba = Vec::new();
        page.render_rgba(&DEFAULT_PALETTE, &mut rgba);
        assert_eq!(rgba, vec![0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn rgb_pages_store_packed_colours() {
        let registry = MemoryRegistry::new();
        let geometry = Geometry::new(4, 2, PixelFormat::Rgb32);
        let mut page = Page::create(&registry, 0, geometry).unwrap();
        page.fill(0x0012_3456);
        page.put_pixel(3, 1, 0xff00_ff00);
        assert_eq!(page.get_pixel(0, 0), 0x0012_3456);
        assert_eq!(page.get_pixel(3, 1), 0x0000_ff00);

        let mut rgba = Vec::new();
        page.render_rgba(&DEFAULT_PALETTE, &mut rgba);
        assert_eq!(&rgba[..4], &[0x12, 0x34, 0x56, 0xff]);
    }
}
