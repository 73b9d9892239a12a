//! WebAssembly host for the engine, backed by wasmtime.

use tracing::debug;
use wasmtime::{Engine, Linker, Memory, Module, Store, TypedFunc};

use super::engine::{check_command, EngineLoader, RenderEngine};
use crate::{BridgeError, Result};

fn engine_err(context: &'static str) -> impl Fn(wasmtime::Error) -> BridgeError {
    move |e| BridgeError::Engine(format!("{context}: {e:#}"))
}

/// Compiles and instantiates engine modules.
pub struct WasmEngineLoader {
    engine: Engine,
}

impl WasmEngineLoader {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
        }
    }
}

impl Default for WasmEngineLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineLoader for WasmEngineLoader {
    fn instantiate(
        &self,
        binary: &[u8],
        sample_rate: u32,
        max_voices: usize,
    ) -> Result<Box<dyn RenderEngine>> {
        let module =
            Module::new(&self.engine, binary).map_err(engine_err("failed to compile engine"))?;
        let mut store = Store::new(&self.engine, ());

        let mut linker = Linker::new(&self.engine);
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(engine_err("failed to link engine imports"))?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(engine_err("failed to instantiate engine"))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BridgeError::Engine("engine exports no memory".into()))?;

        macro_rules! export {
            ($name:literal, $params:ty, $results:ty) => {
                instance
                    .get_typed_func::<$params, $results>(&mut store, $name)
                    .map_err(engine_err(concat!("missing engine export `", $name, "`")))?
            };
        }

        let init = export!("doux_init", (f32, u32), ());
        init.call(&mut store, (sample_rate as f32, max_voices as u32))
            .map_err(engine_err("engine initialisation failed"))?;

        let mut region = |name: &'static str| -> Result<u32> {
            instance
                .get_typed_func::<(), u32>(&mut store, name)
                .and_then(|f| f.call(&mut store, ()))
                .map_err(|e| BridgeError::Engine(format!("failed to read `{name}`: {e:#}")))
        };
        let regions = Regions {
            event_input: region("get_event_input_pointer")?,
            output: region("get_output_pointer")?,
            output_len: region("get_output_len")? as usize,
            input: region("get_input_buffer_pointer")?,
            input_len: region("get_input_buffer_len")? as usize,
            samples: region("get_sample_buffer_pointer")?,
            samples_len: region("get_sample_buffer_len")? as usize,
        };
        debug!(?regions, "engine regions mapped");

        Ok(Box::new(WasmRenderEngine {
            evaluate: export!("evaluate", (), i32),
            dsp: export!("dsp", (), ()),
            get_time: export!("get_time", (), f64),
            get_sample_rate: export!("get_sample_rate", (), f32),
            panic: export!("panic", (), ()),
            hush: export!("hush", (), ()),
            store,
            memory,
            regions,
        }))
    }
}

/// Byte addresses and float lengths of the engine's exported regions.
#[derive(Debug, Clone, Copy)]
struct Regions {
    event_input: u32,
    output: u32,
    output_len: usize,
    input: u32,
    input_len: usize,
    samples: u32,
    samples_len: usize,
}

struct WasmRenderEngine {
    store: Store<()>,
    memory: Memory,
    regions: Regions,
    evaluate: TypedFunc<(), i32>,
    dsp: TypedFunc<(), ()>,
    get_time: TypedFunc<(), f64>,
    get_sample_rate: TypedFunc<(), f32>,
    panic: TypedFunc<(), ()>,
    hush: TypedFunc<(), ()>,
}

impl WasmRenderEngine {
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        self.memory
            .write(&mut self.store, address as usize, bytes)
            .map_err(|e| BridgeError::Engine(format!("engine memory write failed: {e}")))
    }
}

impl RenderEngine for WasmRenderEngine {
    fn write_command(&mut self, command: &[u8]) -> Result<()> {
        check_command(command)?;
        self.write(self.regions.event_input, command)
    }

    fn evaluate(&mut self) -> Result<i32> {
        self.evaluate
            .call(&mut self.store, ())
            .map_err(engine_err("evaluate trapped"))
    }

    fn write_samples(&mut self, offset: usize, data: &[f32]) -> Result<()> {
        if offset + data.len() > self.regions.samples_len {
            return Err(BridgeError::Engine(format!(
                "{} samples at offset {offset} overflow the {}-float pool",
                data.len(),
                self.regions.samples_len
            )));
        }
        let address = self.regions.samples + (offset * 4) as u32;
        self.write(address, bytemuck::cast_slice(data))
    }

    fn write_input(&mut self, block: &[f32]) -> Result<()> {
        let len = block.len().min(self.regions.input_len);
        self.write(self.regions.input, bytemuck::cast_slice(&block[..len]))
    }

    fn render_block(&mut self) -> Result<()> {
        self.dsp
            .call(&mut self.store, ())
            .map_err(engine_err("dsp trapped"))
    }

    fn read_output(&mut self, block: &mut [f32]) -> Result<()> {
        let len = block.len().min(self.regions.output_len);
        self.memory
            .read(
                &self.store,
                self.regions.output as usize,
                bytemuck::cast_slice_mut(&mut block[..len]),
            )
            .map_err(|e| BridgeError::Engine(format!("engine memory read failed: {e}")))
    }

    fn time(&mut self) -> Result<f64> {
        self.get_time
            .call(&mut self.store, ())
            .map_err(engine_err("get_time trapped"))
    }

    fn sample_rate(&mut self) -> Result<f32> {
        self.get_sample_rate
            .call(&mut self.store, ())
            .map_err(engine_err("get_sample_rate trapped"))
    }

    fn panic(&mut self) -> Result<()> {
        self.panic
            .call(&mut self.store, ())
            .map_err(engine_err("panic trapped"))
    }

    fn hush(&mut self) -> Result<()> {
        self.hush
            .call(&mut self.store, ())
            .map_err(engine_err("hush trapped"))
    }

    fn output_len(&self) -> usize {
        self.regions.output_len
    }

    fn sample_capacity(&self) -> usize {
        self.regions.samples_len
    }
}
