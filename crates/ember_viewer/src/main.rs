use anyhow::Result;
use ember_core::{RendererConfig, Scene};
use ember_viewport::Renderer;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

/// Application state
struct App {
    config: RendererConfig,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    last_frame_time: Instant,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        Self {
            config,
            window: None,
            renderer: None,
            last_frame_time: Instant::now(),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attrs = Window::default_attributes()
            .with_title("Ember")
            .with_inner_size(winit::dpi::PhysicalSize::new(1280, 720));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let scene = Scene::cornell_box()?;
        let renderer = pollster::block_on(Renderer::new(window.clone(), scene, self.config.clone()))?;

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = &mut self.renderer {
            renderer.drain();
            let stats = renderer.stats();
            log::info!(
                "Rendered {} frames ({} skipped), {} samples",
                stats.submitted,
                stats.skipped,
                renderer.samples()
            );
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                log::error!("Failed to initialize renderer: {:#}", e);
                event_loop.exit();
                return;
            }
            log::info!("Window and renderer initialized");
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.shutdown(event_loop),
            WindowEvent::Resized(physical_size) => {
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize((physical_size.width, physical_size.height)) {
                        log::error!("Resize failed: {:#}", e);
                        event_loop.exit();
                        return;
                    }
                    log::info!("Resized to {}x{}", physical_size.width, physical_size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                let delta_time = (now - self.last_frame_time).as_secs_f32();
                self.last_frame_time = now;

                if let (Some(renderer), Some(window)) = (&mut self.renderer, &self.window) {
                    renderer.update_fps(delta_time);

                    if let Err(e) = renderer.render() {
                        log::error!("Render error: {:#}", e);
                    }
                    window.set_title(&format!(
                        "Ember - {} spp - {:.1} fps",
                        renderer.samples(),
                        renderer.fps
                    ));
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting Ember Viewer");

    let config = match std::env::args().nth(1) {
        Some(path) => RendererConfig::from_json_file(&path)?,
        None => RendererConfig::default(),
    };

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);

    log::info!("Running event loop");
    event_loop.run_app(&mut app)?;

    Ok(())
}
