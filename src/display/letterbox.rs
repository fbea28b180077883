use winit::dpi::PhysicalPosition;

/// Where the page lands inside the window: integer upscale when it fits,
/// stretched down otherwise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub page_w: u32,
    pub page_h: u32,
    pub dest_x: u32,
    pub dest_y: u32,
    pub dest_w: u32,
    pub dest_h: u32,
    scale_x: f64,
    scale_y: f64,
}

impl Letterbox {
    pub fn new(page_w: u32, page_h: u32, output_w: u32, output_h: u32) -> Self {
        let page_w = page_w.max(1);
        let page_h = page_h.max(1);
        let output_w = output_w.max(1);
        let output_h = output_h.max(1);
        let scale = (output_w / page_w).min(output_h / page_h);

        if scale >= 1 {
            let dest_w = page_w * scale;
            let dest_h = page_h * scale;
            return Self {
                page_w,
                page_h,
                dest_x: (output_w - dest_w) / 2,
                dest_y: (output_h - dest_h) / 2,
                dest_w,
                dest_h,
                scale_x: scale as f64,
                scale_y: scale as f64,
            };
        }

        Self {
            page_w,
            page_h,
            dest_x: 0,
            dest_y: 0,
            dest_w: output_w,
            dest_h: output_h,
            scale_x: output_w as f64 / page_w as f64,
            scale_y: output_h as f64 / page_h as f64,
        }
    }

    /// Window position to page pixel; `None` over the black bars.
    pub fn map_point(&self, pos: PhysicalPosition<f64>) -> Option<(i32, i32)> {
        let (x, y) = (pos.x.floor(), pos.y.floor());
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let (x, y) = (x as i64, y as i64);
        let x0 = i64::from(self.dest_x);
        let y0 = i64::from(self.dest_y);
        if x < x0 || y < y0 || x >= x0 + i64::from(self.dest_w) || y >= y0 + i64::from(self.dest_h)
        {
            return None;
        }

        let px = (((x - x0) as f64 / self.scale_x).floor() as i32).clamp(0, self.page_w as i32 - 1);
        let py = (((y - y0) as f64 / self.scale_y).floor() as i32).clamp(0, self.page_h as i32 - 1);
        Some((px, py))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_size_maps_one_to_one() {
        let lb = Letterbox::new(640, 480, 640, 480);
        assert_eq!((lb.dest_x, lb.dest_y, lb.dest_w, lb.dest_h), (0, 0, 640, 480));
        assert_eq!(lb.map_point(PhysicalPosition::new(639.5, 0.2)), Some((639, 0)));
    }

    #[test]
    fn fullscreen_upscales_with_bars() {
        let lb = Letterbox::new(640, 480, 1920, 1080);
        assert_eq!((lb.dest_w, lb.dest_h), (1280, 960));
        assert_eq!((lb.dest_x, lb.dest_y), (320, 60));
        assert_eq!(lb.map_point(PhysicalPosition::new(100.0, 500.0)), None);
        assert_eq!(lb.map_point(PhysicalPosition::new(321.0, 61.0)), Some((0, 0)));
        assert_eq!(lb.map_point(PhysicalPosition::new(1599.0, 1019.0)), Some((639, 479)));
    }

    #[test]
    fn small_window_stretches_down() {
        let lb = Letterbox::new(1024, 768, 512, 384);
        assert_eq!((lb.dest_w, lb.dest_h), (512, 384));
        assert_eq!(lb.map_point(PhysicalPosition::new(511.0, 383.0)), Some((1022, 766)));
    }
}
