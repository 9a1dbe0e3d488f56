#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use eyre::WrapErr;
use forge_gpu::{
    ash::{self, vk},
    capabilities::QueueRole,
    command::CommandPool,
    device::{Device, DeviceInfo},
    frame::{DEFAULT_FRAMES_IN_FLIGHT, FramesInFlight},
    instance::{Instance, InstanceInfo, VulkanLogLevel},
    pipeline::{GraphicsPipelineState, Pipeline, PipelineLayout},
    pipeline_cache::PipelineCache,
    queue::Queue,
    render_pass::{Framebuffer, RenderPass, RenderPassDescription},
    shader::{ShaderModule, ShaderStage},
    surface::{Surface, Window},
    swapchain::{Swapchain, SwapchainInfo},
};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window as WinitWindow, WindowAttributes, WindowId},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Never reaches the subscriber; tracing is not installed for Off.
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliPresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

impl From<CliPresentMode> for vk::PresentModeKHR {
    fn from(value: CliPresentMode) -> Self {
        match value {
            CliPresentMode::Fifo => vk::PresentModeKHR::FIFO,
            CliPresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            CliPresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    /// Frames the host may record ahead of the device.
    #[arg(long, default_value_t = DEFAULT_FRAMES_IN_FLIGHT)]
    frames_in_flight: usize,
    /// Preferred present mode; falls back to MAILBOX, then FIFO.
    #[arg(long)]
    present_mode: Option<CliPresentMode>,
    /// Pipeline cache file. Defaults to the user cache directory.
    #[arg(long)]
    pipeline_cache: Option<PathBuf>,
    /// SPIR-V vertex shader drawn as a full-screen triangle over the clear.
    #[arg(long, requires = "fragment_shader")]
    vertex_shader: Option<PathBuf>,
    #[arg(long, requires = "vertex_shader")]
    fragment_shader: Option<PathBuf>,
}

/// Settings that outlive instance creation.
#[derive(Debug, Clone)]
struct AppConfig {
    frames_in_flight: usize,
    present_mode: Option<vk::PresentModeKHR>,
    pipeline_cache_path: PathBuf,
    shaders: Option<(PathBuf, PathBuf)>,
}

fn init_tracing(cli_args: &CliArgs, log_dir: &Path) -> eyre::Result<()> {
    if cli_args.tracing_log_level == TracingLogLevel::Off {
        return Ok(());
    }
    fs::create_dir_all(log_dir)?;

    let mut log_file_path = log_dir.to_owned();
    log_file_path.push("log-file");
    log_file_path.set_extension("txt");
    let log_file = File::create(&log_file_path)?;
    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    println!("log_file_path: {}", log_file_path.display());
    println!("cli_args: {:#?}", cli_args);

    let stdout_log = tracing_subscriber::fmt::layer().pretty();

    tracing_subscriber::registry()
        .with(
            stdout_log
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    cli_args.tracing_log_level.into(),
                ))
                .and_then(file_log),
        )
        .init();
    Ok(())
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "forge", "forge-app");
    let cli_args = CliArgs::parse();
    eyre::ensure!(
        cli_args.frames_in_flight > 0,
        "--frames-in-flight must be at least 1"
    );

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    init_tracing(&cli_args, &log_dir).wrap_err("Failed to set up logging")?;

    let pipeline_cache_path = match (&cli_args.pipeline_cache, &app_dirs) {
        (Some(path), _) => path.clone(),
        (None, Some(dirs)) => dirs.cache_dir().join("pipeline.cache"),
        (None, None) => std::env::current_dir()?.join("pipeline.cache"),
    };
    let config = AppConfig {
        frames_in_flight: cli_args.frames_in_flight,
        present_mode: cli_args.present_mode.map(Into::into),
        pipeline_cache_path,
        shaders: cli_args.vertex_shader.clone().zip(cli_args.fragment_shader.clone()),
    };

    let event_loop = winit::event_loop::EventLoop::builder()
        .build()
        .wrap_err("Failed to create event loop")?;

    // SAFETY: Loads Vulkan via libloading; the loader is trusted.
    let instance = Arc::new(
        unsafe {
            Instance::new(
                &InstanceInfo {
                    app_name: String::from("forge-app"),
                    validation: cli_args.graphics_debug_level.map(Into::into),
                    surface: true,
                },
                Some(&event_loop),
            )
        }
        .wrap_err("Failed to create instance")?,
    );

    let mut app = AppRunner {
        state: Some(App::Initializing(InitializingState { instance, config })),
        failure: None,
    };

    tracing::trace!("Entering main event loop");
    event_loop.run_app(&mut app)?;
    match app.failure {
        Some(report) => Err(report),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// The winit window, made presentable for forge-gpu surfaces.
#[derive(Debug)]
struct AppWindow(WinitWindow);

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.0.window_handle()
    }
}

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.0.display_handle()
    }
}

impl Window for AppWindow {
    fn extent(&self) -> vk::Extent2D {
        let size = self.0.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

// ---------------------------------------------------------------------------
// GPU state
// ---------------------------------------------------------------------------

/// A vertex/fragment pair and the empty layout they are drawn with.
#[derive(Debug)]
struct Shaders {
    vertex: ShaderModule,
    fragment: ShaderModule,
    layout: Arc<PipelineLayout>,
}

impl Shaders {
    fn load(device: &Arc<Device>, vertex: &Path, fragment: &Path) -> eyre::Result<Self> {
        Ok(Self {
            vertex: ShaderModule::from_file(device, vertex)
                .wrap_err("Failed to load vertex shader")?,
            fragment: ShaderModule::from_file(device, fragment)
                .wrap_err("Failed to load fragment shader")?,
            layout: Arc::new(
                PipelineLayout::new_empty(device).wrap_err("Failed to create pipeline layout")?,
            ),
        })
    }

    fn pipeline(
        &self,
        device: &Arc<Device>,
        render_pass: &RenderPass,
        cache: &PipelineCache,
    ) -> eyre::Result<Pipeline> {
        let stages = [
            self.vertex.entry_point("main", ShaderStage::Vertex)?,
            self.fragment.entry_point("main", ShaderStage::Fragment)?,
        ];
        let state = GraphicsPipelineState {
            stages: &stages,
            ..Default::default()
        };
        Pipeline::graphics(
            device,
            &state,
            &self.layout,
            render_pass,
            0,
            Some(cache),
            Some("full-screen pass"),
        )
        .wrap_err("Failed to create pipeline")
    }
}

/// Device-level objects. They survive suspend; only the surface and the
/// swapchain are torn down.
#[derive(Debug)]
struct Gpu {
    frames: FramesInFlight,
    queue: Queue,
    shaders: Option<Shaders>,
    pipeline_cache: PipelineCache,
    device: Arc<Device>,
    frame_count: u64,
}

impl Gpu {
    fn new(
        instance: &Arc<Instance>,
        surface: &Surface<AppWindow>,
        config: &AppConfig,
    ) -> eyre::Result<Self> {
        let physical_device = instance
            .pick_physical_device(|pd| {
                pd.capabilities()
                    .supports_extension(ash::khr::swapchain::NAME)
                    && surface.is_presentable_from(pd)
            })
            .ok_or_else(|| eyre::eyre!("No Vulkan device can present to this window"))?;

        let device = Arc::new(
            Device::new(
                instance,
                physical_device,
                &DeviceInfo {
                    enable_swapchain: true,
                    name: Some(String::from("forge-app device")),
                    ..Default::default()
                },
            )
            .wrap_err("Failed to create device")?,
        );
        let queue = device
            .queue(QueueRole::Graphics)
            .ok_or_else(|| eyre::eyre!("Device has no graphics queue"))?;
        // The frame command buffers keep the native pool alive.
        let pool = CommandPool::new(&device, queue.family_index(), Some("frame commands"))
            .wrap_err("Failed to create command pool")?;
        let frames = FramesInFlight::new(&device, &pool, config.frames_in_flight)
            .wrap_err("Failed to create frames in flight")?;
        let pipeline_cache = PipelineCache::read_pipeline_cache(&device, &config.pipeline_cache_path)
            .wrap_err("Failed to create pipeline cache")?;
        let shaders = config
            .shaders
            .as_ref()
            .map(|(vertex, fragment)| Shaders::load(&device, vertex, fragment))
            .transpose()?;

        Ok(Self {
            frames,
            queue,
            shaders,
            pipeline_cache,
            device,
            frame_count: 0,
        })
    }

    /// Wait for the device and persist the pipeline cache.
    fn finish(&self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Error while waiting for device idle at exit: {}", e);
        }
        if let Err(e) = self.pipeline_cache.save_cache() {
            tracing::error!("Error while saving pipeline cache: {}", e);
        }
    }
}

/// Everything built on top of the current swapchain.
///
/// Field order is drop order: framebuffers reference the swapchain views.
#[derive(Debug)]
struct SwapchainTargets {
    pipeline: Option<Pipeline>,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
    swapchain: Swapchain<AppWindow>,
}

impl SwapchainTargets {
    fn new(gpu: &Gpu, swapchain: Swapchain<AppWindow>) -> eyre::Result<Self> {
        let render_pass = RenderPass::new(
            &gpu.device,
            RenderPassDescription::single_color(
                swapchain.format(),
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
            Some("clear pass"),
        )
        .wrap_err("Failed to create render pass")?;

        let framebuffers = swapchain
            .image_views()
            .iter()
            .enumerate()
            .map(|(i, view)| {
                // SAFETY: The views belong to `swapchain`, which this struct
                // drops after the framebuffers.
                unsafe {
                    Framebuffer::new(
                        &gpu.device,
                        &render_pass,
                        &[view],
                        swapchain.extent(),
                        Some(&format!("swapchain framebuffer {i}")),
                    )
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("Failed to create framebuffers")?;

        let pipeline = gpu
            .shaders
            .as_ref()
            .map(|shaders| shaders.pipeline(&gpu.device, &render_pass, &gpu.pipeline_cache))
            .transpose()?;

        Ok(Self {
            pipeline,
            framebuffers,
            render_pass,
            swapchain,
        })
    }
}

fn clear_colour(frame: u64) -> vk::ClearValue {
    let t = (frame % 600) as f32 / 600.0 * std::f32::consts::TAU;
    let third = std::f32::consts::TAU / 3.0;
    vk::ClearValue {
        color: vk::ClearColorValue {
            float32: [
                0.5 + 0.5 * t.sin(),
                0.5 + 0.5 * (t + third).sin(),
                0.5 + 0.5 * (t + 2.0 * third).sin(),
                1.0,
            ],
        },
    }
}

/// Record, submit and present one frame. Returns whether the swapchain
/// should be recreated.
fn draw_frame(gpu: &mut Gpu, targets: &SwapchainTargets) -> eyre::Result<bool> {
    let acquired = gpu
        .frames
        .begin_frame(&targets.swapchain, u64::MAX)
        .wrap_err("Failed to begin frame")?;
    let Some(image_index) = acquired.image_index else {
        return Ok(acquired.status.needs_recreate());
    };

    let framebuffer = &targets.framebuffers[image_index as usize];
    let area = framebuffer.full_area();
    let clear = clear_colour(gpu.frame_count);

    let cb = gpu.frames.command_buffer();
    cb.begin(true, None)
        .wrap_err("Failed to begin command buffer")?;
    cb.begin_render_pass(
        &targets.render_pass,
        framebuffer,
        area,
        &[clear],
        vk::SubpassContents::INLINE,
    );
    if let Some(pipeline) = &targets.pipeline {
        cb.bind_pipeline(pipeline);
        cb.set_viewport(&[vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }]);
        cb.set_scissor(&[area]);
        // SAFETY: The pipeline has no vertex inputs and no descriptor sets;
        // its vertex shader builds the triangle from the vertex index.
        unsafe { cb.draw(3, 1, 0, 0) };
    }
    cb.end_render_pass();
    cb.end().wrap_err("Failed to end command buffer")?;

    gpu.frames
        .submit(&gpu.queue)
        .wrap_err("Failed to submit frame")?;
    let presented = gpu
        .frames
        .present(&gpu.queue, &targets.swapchain, image_index)
        .wrap_err("Failed to present frame")?;
    gpu.frame_count += 1;

    Ok(acquired.status.needs_recreate() || presented.needs_recreate())
}

// ---------------------------------------------------------------------------
// Application state machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AppRunner {
    state: Option<App>,
    failure: Option<eyre::Report>,
}

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Suspended(SuspendedState),
    Exiting(ExitingState),
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    config: AppConfig,
}

// Field order is drop order: swapchain objects, then the surface, then the
// device-level objects.
#[derive(Debug)]
struct RunningState {
    // `None` means the window is currently zero-sized. We stay in Running and
    // recreate on the next non-zero resize.
    targets: Option<SwapchainTargets>,
    surface: Arc<Surface<AppWindow>>,
    gpu: Gpu,
    win: Arc<AppWindow>,
    instance: Arc<Instance>,
    config: AppConfig,
}

#[derive(Debug)]
struct SuspendedState {
    gpu: Gpu,
    win: Arc<AppWindow>,
    instance: Arc<Instance>,
    config: AppConfig,
}

#[derive(Debug)]
struct ExitingState {}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.state.is_some());
        if let Some(initializing_state) = self.take_initializing() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let InitializingState { instance, config } = initializing_state;
            let running = event_loop
                .create_window(
                    WindowAttributes::default()
                        .with_title("forge")
                        .with_inner_size(LogicalSize {
                            width: 1600,
                            height: 900,
                        }),
                )
                .wrap_err("Failed to create window")
                .and_then(|win| {
                    let win = Arc::new(AppWindow(win));
                    let surface = create_surface(&instance, &win)?;
                    let gpu = Gpu::new(&instance, &surface, &config)?;
                    let targets = create_targets(&gpu, &surface, &config, win.extent())?;
                    Ok(RunningState {
                        targets,
                        surface,
                        gpu,
                        win,
                        instance,
                        config,
                    })
                });
            match running {
                Ok(running) => {
                    tracing::debug!("State transition: Initializing -> Running");
                    self.set_running(running);
                }
                Err(report) => self.fail("Initializing", event_loop, report),
            }
        } else if let Some(suspended_state) = self.take_suspended() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let SuspendedState {
                gpu,
                win,
                instance,
                config,
            } = suspended_state;
            let surface_and_targets = create_surface(&instance, &win).and_then(|surface| {
                let targets = create_targets(&gpu, &surface, &config, win.extent())?;
                Ok((surface, targets))
            });
            match surface_and_targets {
                Ok((surface, targets)) => {
                    tracing::debug!("State transition: Suspended -> Running");
                    self.set_running(RunningState {
                        targets,
                        surface,
                        gpu,
                        win,
                        instance,
                        config,
                    });
                }
                Err(report) => {
                    gpu.finish();
                    self.fail("Suspended", event_loop, report);
                }
            }
        } else if self.is_exiting() {
            tracing::warn!("resumed() called while in Exiting state");
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.state.is_some());
        if let Some(running_state) = self.take_running() {
            event_loop.set_control_flow(ControlFlow::Wait);
            if let Err(e) = running_state.gpu.device.wait_idle() {
                running_state.gpu.finish();
                self.fail(
                    "Running",
                    event_loop,
                    eyre::Report::new(e).wrap_err("Failed to wait for device idle on suspend"),
                );
                return;
            }
            let RunningState {
                targets,
                surface,
                gpu,
                win,
                instance,
                config,
            } = running_state;
            drop(targets);
            drop(surface);

            tracing::debug!("State transition: Running -> Suspended");
            self.set_suspended(SuspendedState {
                gpu,
                win,
                instance,
                config,
            });
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        window_event: WindowEvent,
    ) {
        assert!(self.state.is_some());
        let Some(running_state) = self.as_running_mut() else {
            return;
        };
        if window_id != running_state.win.0.id() {
            return;
        }

        let result = match &window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                self.exit_from_running(event_loop);
                return;
            }
            WindowEvent::Resized(size) => recreate_targets(
                running_state,
                vk::Extent2D {
                    width: size.width,
                    height: size.height,
                },
                false,
            ),
            WindowEvent::ScaleFactorChanged { .. } => {
                let extent = running_state.win.extent();
                recreate_targets(running_state, extent, false)
            }
            WindowEvent::RedrawRequested => {
                let needs_recreate = match running_state.targets.as_ref() {
                    Some(targets) => draw_frame(&mut running_state.gpu, targets),
                    None => Ok(false),
                };
                match needs_recreate {
                    Ok(true) => {
                        let extent = running_state.win.extent();
                        recreate_targets(running_state, extent, true)
                    }
                    other => other.map(|_| ()),
                }
            }
            _ => Ok(()),
        };

        if let Err(report) = result {
            self.fail_from_running(event_loop, report);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running_state)) = self.state.as_ref() {
            running_state.win.0.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running_state)) = self.state.as_ref() {
            tracing::debug!("Event loop exiting while running");
            running_state.gpu.finish();
        }
    }
}

fn create_surface(
    instance: &Arc<Instance>,
    win: &Arc<AppWindow>,
) -> eyre::Result<Arc<Surface<AppWindow>>> {
    // SAFETY: The surface is dropped on `suspended`, before the platform
    // invalidates the window.
    let surface = unsafe { Surface::new(instance, Arc::clone(win)) }
        .wrap_err("Failed to create surface")?;
    Ok(Arc::new(surface))
}

fn create_targets(
    gpu: &Gpu,
    surface: &Arc<Surface<AppWindow>>,
    config: &AppConfig,
    extent: vk::Extent2D,
) -> eyre::Result<Option<SwapchainTargets>> {
    if extent.width == 0 || extent.height == 0 {
        tracing::trace!(
            "Skipping swapchain create because window extent is zero: {}x{}",
            extent.width,
            extent.height
        );
        return Ok(None);
    }
    let _span = tracing::trace_span!(
        "swapchain_create",
        requested_width = extent.width,
        requested_height = extent.height
    )
    .entered();
    let swapchain = Swapchain::new(
        &gpu.device,
        surface,
        SwapchainInfo {
            desired_extent: extent,
            preferred_format: None,
            preferred_present_mode: config.present_mode,
        },
        Some("window swapchain"),
    )
    .wrap_err("Failed to create swapchain")?;
    SwapchainTargets::new(gpu, swapchain).map(Some)
}

/// Rebuild the swapchain for `extent`, retiring the current one.
///
/// Unless `force` is set, an unchanged extent is left alone. A zero extent
/// tears the swapchain down until the next resize.
fn recreate_targets(
    running_state: &mut RunningState,
    extent: vk::Extent2D,
    force: bool,
) -> eyre::Result<()> {
    if extent.width == 0 || extent.height == 0 {
        tracing::trace!(
            "Received zero extent ({}x{}); tearing down swapchain",
            extent.width,
            extent.height
        );
        running_state
            .gpu
            .device
            .wait_idle()
            .wrap_err("Failed to wait for device idle")?;
        running_state.targets = None;
        return Ok(());
    }

    if !force
        && let Some(targets) = running_state.targets.as_ref()
        && targets.swapchain.extent() == extent
    {
        tracing::trace!(
            "Skipping swapchain recreate because extent is unchanged: {}x{}",
            extent.width,
            extent.height
        );
        return Ok(());
    }

    tracing::trace!(
        "Recreating swapchain for extent: {}x{}",
        extent.width,
        extent.height
    );
    running_state
        .gpu
        .device
        .wait_idle()
        .wrap_err("Failed to wait for device idle")?;

    let targets = match running_state.targets.as_ref() {
        Some(old) => {
            let swapchain = old
                .swapchain
                .recreate(extent)
                .wrap_err("Failed to recreate swapchain")?;
            Some(SwapchainTargets::new(&running_state.gpu, swapchain)?)
        }
        None => create_targets(
            &running_state.gpu,
            &running_state.surface,
            &running_state.config,
            extent,
        )?,
    };
    // The retired swapchain and its framebuffers go away here.
    running_state.targets = targets;
    Ok(())
}

impl AppRunner {
    fn transition_to_exiting(&mut self, from_state: &'static str, event_loop: &ActiveEventLoop) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.set_exiting(ExitingState {});
        event_loop.exit();
    }

    /// Record a fatal error and leave the event loop. The state must already
    /// have been taken.
    fn fail(&mut self, from_state: &'static str, event_loop: &ActiveEventLoop, report: eyre::Report) {
        tracing::error!("{:?}", report);
        self.failure = Some(report);
        self.transition_to_exiting(from_state, event_loop);
    }

    fn fail_from_running(&mut self, event_loop: &ActiveEventLoop, report: eyre::Report) {
        match self.take_running() {
            Some(running_state) => {
                running_state.gpu.finish();
                drop(running_state);
                self.fail("Running", event_loop, report);
            }
            None => {
                tracing::error!("{:?}", report);
                self.failure = Some(report);
                event_loop.exit();
            }
        }
    }

    fn exit_from_running(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(running_state) = self.take_running() {
            running_state.gpu.finish();
            drop(running_state);
            self.transition_to_exiting("Running", event_loop);
        } else {
            tracing::warn!("Requested Running -> Exiting transition while not in Running state");
            event_loop.exit();
        }
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        assert!(self.state.is_some());
        if matches!(self.state, Some(App::Initializing(_))) {
            match self.state.take() {
                Some(App::Initializing(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn take_running(&mut self) -> Option<RunningState> {
        assert!(self.state.is_some());
        if matches!(self.state, Some(App::Running(_))) {
            match self.state.take() {
                Some(App::Running(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        assert!(self.state.is_some());
        match &mut self.state {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn set_running(&mut self, state: RunningState) {
        assert!(self.state.is_none());
        self.state = Some(App::Running(state));
    }

    fn take_suspended(&mut self) -> Option<SuspendedState> {
        assert!(self.state.is_some());
        if matches!(self.state, Some(App::Suspended(_))) {
            match self.state.take() {
                Some(App::Suspended(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn set_suspended(&mut self, state: SuspendedState) {
        assert!(self.state.is_none());
        self.state = Some(App::Suspended(state));
    }

    fn is_exiting(&self) -> bool {
        assert!(self.state.is_some());
        matches!(self.state, Some(App::Exiting(_)))
    }

    fn set_exiting(&mut self, state: ExitingState) {
        assert!(self.state.is_none());
        self.state = Some(App::Exiting(state));
    }
}
