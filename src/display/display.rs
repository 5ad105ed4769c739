//! SDL2 Preview Window
//! Shows the frames posted to a `FrameSurface` and turns key presses into
//! pipeline commands. Uses the sdl2 crate for window management and rendering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, RecvTimeoutError};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};

use tracing::info;

use crate::display::PresentedFrame;

/// How long the window waits for a frame before polling events again.
const FRAME_POLL: Duration = Duration::from_millis(16);

/// User intents forwarded to the pipeline controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewCommand {
    StartScan,
    StopScan,
    SwitchCamera,
}

/// SDL2 Window Display
/// Handles window creation, event loop, and frame rendering.
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, title: &str, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window_builder = video_subsystem
            .window(title, width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas_builder = window_builder.into_canvas().present_vsync();

        let canvas = canvas_builder.build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
        })
    }

    pub fn render_frame(&mut self, frame: &PresentedFrame) -> Result<()> {
        // ABGR8888 is laid out R, G, B, A in memory on little-endian hosts
        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::ABGR8888, frame.width, frame.height)
            .map_err(|e| eyre!(e))?;

        texture
            .update(None, &frame.data, (frame.stride * 4) as usize)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;

        self.canvas.present();
        Ok(())
    }

    /// Render until the window closes or `running` is cleared.
    pub fn run<F>(
        &mut self,
        sdl_context: &sdl2::Sdl,
        rx: Receiver<PresentedFrame>,
        running: &AtomicBool,
        mut on_command: F,
    ) -> Result<()>
    where
        F: FnMut(PreviewCommand),
    {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        info!("Keys: [s] scan  [x] stop scan  [c] switch camera  [esc] quit");

        'running: while running.load(Ordering::Relaxed) {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::KeyDown {
                        keycode: Some(key),
                        repeat: false,
                        ..
                    } => match key {
                        Keycode::S => on_command(PreviewCommand::StartScan),
                        Keycode::X => on_command(PreviewCommand::StopScan),
                        Keycode::C => on_command(PreviewCommand::SwitchCamera),
                        _ => {}
                    },
                    _ => {}
                }
            }

            match rx.recv_timeout(FRAME_POLL) {
                Ok(frame) => self.render_frame(&frame)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Presentation surface gone");
                    break;
                }
            }
        }

        Ok(())
    }
}
