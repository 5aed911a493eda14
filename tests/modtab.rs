//! Module registry: insmod, path lookup, prefix iteration and the property channel.

use {
	crate::{
		module::{mem::MemPipeModule, Module, Registry},
		prop::{PropRegistry, PropValue},
		Result as PlumberResult,
	},
	crate::tests::util::*,
	color_eyre::eyre::ensure,
	std::sync::{Arc, Mutex},
};

/// A trivial module with a configurable suffix and a property cell, for registry tests.
struct FakeModule {
	suffix: &'static str,
	knob: Mutex<i64>,
	exited: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeModule {
	fn new(suffix: &'static str, exited: &Arc<Mutex<Vec<&'static str>>>) -> Box<Self> {
		Box::new(Self { suffix, knob: Mutex::new(0), exited: Arc::clone(exited) })
	}
}

impl Module for FakeModule {
	fn mod_prefix(&self) -> &'static str {
		"pipe"
	}

	fn init(&mut self, _args: &[String]) -> PlumberResult<()> {
		Ok(())
	}

	fn path_suffix(&self) -> String {
		self.suffix.to_owned()
	}

	fn deallocate(&self, _body: crate::module::PipeBody) -> PlumberResult<Option<crate::module::PipeBody>> {
		Ok(None)
	}

	fn get_property(&self, symbol: &str) -> PropValue {
		match symbol {
			"knob" => PropValue::Integer(*self.knob.lock().unwrap()),
			_ => PropValue::None,
		}
	}

	fn set_property(&self, symbol: &str, value: PropValue) -> PlumberResult<bool> {
		match (symbol, value) {
			("knob", PropValue::Integer(n)) => {
				*self.knob.lock().unwrap() = n;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	fn on_exit(&self) -> PlumberResult<()> {
		self.exited.lock().unwrap().push(self.suffix);
		Ok(())
	}
}

#[test]
fn paths_are_unique_and_ordered() -> TestResult {
	testinit();
	let exited = Arc::new(Mutex::new(Vec::new()));
	let props = Arc::new(PropRegistry::new());
	let mut registry = Registry::new(Arc::clone(&props));

	let mem = registry.insmod(Box::new(MemPipeModule::new()), &[])?;
	registry.insmod(FakeModule::new("tcp", &exited), &[])?;
	registry.insmod(FakeModule::new("tls", &exited), &[])?;
	ensure_eq!(registry.len(), 3);

	// a colliding path is refused and the registry is unchanged
	ensure!(registry.insmod(FakeModule::new("tcp", &exited), &[]).is_err(), "duplicate path accepted");
	ensure_eq!(registry.len(), 3);

	let inst = registry.get_from_path("pipe.mem").expect("pipe.mem lost");
	ensure_eq!(inst.module_type(), mem);
	ensure_eq!(registry.get_module_type_from_path("pipe.mem")?, mem);
	ensure!(registry.get_from_path("pipe.nope").is_none(), "phantom module found");
	ensure!(registry.get_from_path("pipe.tc").is_none(), "prefix matched as exact");

	// type ids resolve back to the same instances
	ensure_eq!(registry.get_from_module_type(mem).map(|m| m.path().to_owned()), Some("pipe.mem".to_owned()));
	Ok(())
}

#[test]
fn prefix_iteration_walks_a_contiguous_range() -> TestResult {
	testinit();
	let exited = Arc::new(Mutex::new(Vec::new()));
	let props = Arc::new(PropRegistry::new());
	let mut registry = Registry::new(props);

	registry.insmod(Box::new(MemPipeModule::new()), &[])?;
	registry.insmod(FakeModule::new("tcp", &exited), &[])?;
	registry.insmod(FakeModule::new("tls", &exited), &[])?;

	let all: Vec<String> = registry.open_dir("pipe.").map(|m| m.path().to_owned()).collect();
	ensure_eq!(all, vec!["pipe.mem".to_owned(), "pipe.tcp".to_owned(), "pipe.tls".to_owned()]);

	let t_only: Vec<String> = registry.open_dir("pipe.t").map(|m| m.path().to_owned()).collect();
	ensure_eq!(t_only, vec!["pipe.tcp".to_owned(), "pipe.tls".to_owned()]);

	ensure_eq!(registry.open_dir("tty.").count(), 0);
	Ok(())
}

#[test]
fn properties_route_through_the_module_path() -> TestResult {
	testinit();
	let exited = Arc::new(Mutex::new(Vec::new()));
	let props = Arc::new(PropRegistry::new());
	let mut registry = Registry::new(Arc::clone(&props));
	registry.insmod(FakeModule::new("tcp", &exited), &[])?;

	// probing the bare module path answers "present"
	ensure_eq!(props.get("pipe.tcp"), PropValue::Integer(1));
	ensure_eq!(props.get("pipe.tcp.knob"), PropValue::Integer(0));
	ensure!(props.set("pipe.tcp.knob", PropValue::Integer(7))?, "knob not claimed");
	ensure_eq!(props.get("pipe.tcp.knob"), PropValue::Integer(7));
	ensure!(!props.set("pipe.tcp.missing", PropValue::Integer(1))?, "unknown symbol claimed");
	ensure!(!props.set("no.such.prefix", PropValue::Integer(1))?, "unknown prefix claimed");
	Ok(())
}

#[test]
fn exit_hooks_run_for_every_module() -> TestResult {
	testinit();
	let exited = Arc::new(Mutex::new(Vec::new()));
	let props = Arc::new(PropRegistry::new());
	let mut registry = Registry::new(props);
	registry.insmod(FakeModule::new("tcp", &exited), &[])?;
	registry.insmod(FakeModule::new("tls", &exited), &[])?;

	registry.on_exit()?;
	ensure_eq!(*exited.lock().unwrap(), vec!["tcp", "tls"]);
	registry.finalize()?;
	Ok(())
}

#[test]
fn pipes_allocate_through_the_instance() -> TestResult {
	testinit();
	let (_props, registry) = mem_registry()?;
	let (mut rd, mut wr) = mem_pair(&registry)?;
	wr.write(b"hello")?;
	drop(wr);
	let bytes = read_to_eof(&mut rd, std::time::Duration::from_secs(1))?;
	ensure_eq!(bytes, b"hello".to_vec());
	Ok(())
}
