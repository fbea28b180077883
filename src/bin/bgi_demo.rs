use std::{process::ExitCode, time::Duration};

use bgi_rt::{
    GraphicsMode, Key, NavKey, Page, Session,
    input::button,
    logging,
    palette::{BLUE, LIGHTRED, WHITE, YELLOW},
};

const RECT_W: i32 = 40;
const RECT_H: i32 = 30;
const STEP: i32 = 4;
const KEY_ESCAPE: char = '\u{1b}';

fn clamp_i32(v: i32, min_v: i32, max_v: i32) -> i32 {
    v.max(min_v).min(max_v)
}

fn fill_rect(page: &mut Page, x: i32, y: i32, w: i32, h: i32, colour: u32) {
    for py in y..y + h {
        for px in x..x + w {
            page.put_pixel(px, py, colour);
        }
    }
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "demo failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> bgi_rt::Result<()> {
    let options = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let mut session = Session::init_graph(GraphicsMode::VgaHi, &options)?;
    let (w, h) = (session.width() as i32, session.height() as i32);

    let mut rect_x = w / 2 - RECT_W / 2;
    let mut rect_y = h / 2 - RECT_H / 2;

    loop {
        let background = session.pixel_value(BLUE as u32);
        let border = session.pixel_value(WHITE as u32);
        let fill = session.pixel_value(LIGHTRED as u32);
        let bar = session.pixel_value(YELLOW as u32);

        let page = session.active_page_mut();
        page.fill(background);
        fill_rect(page, 0, 0, w, 8, bar);
        fill_rect(page, rect_x, rect_y, RECT_W, RECT_H, border);
        fill_rect(page, rect_x + 2, rect_y + 2, RECT_W - 4, RECT_H - 4, fill);
        session.flip()?;

        let mouse = session.mouse_state();
        if mouse.is_pressed(button::LEFT) {
            rect_x = mouse.x - RECT_W / 2;
            rect_y = mouse.y - RECT_H / 2;
        }

        match session.read_key_timeout(Duration::from_millis(16))? {
            Some(Key::Char(KEY_ESCAPE | 'q' | 'Q')) => break,
            Some(Key::Nav(NavKey::Left)) => rect_x -= STEP,
            Some(Key::Nav(NavKey::Right)) => rect_x += STEP,
            Some(Key::Nav(NavKey::Up)) => rect_y -= STEP,
            Some(Key::Nav(NavKey::Down)) => rect_y += STEP,
            Some(_) | None => {}
        }

        rect_x = clamp_i32(rect_x, 0, w - RECT_W);
        rect_y = clamp_i32(rect_y, 8, h - RECT_H);
    }

    tracing::info!(fps = session.fps(), "demo done");
    session.close();
    Ok(())
}
