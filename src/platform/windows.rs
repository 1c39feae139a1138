/// Windows process control: every child runs inside its own job object
use crate::process::{ProcessControl, Spawned};
use crate::types::{ExitStatus, HoudiniError, ProcessSignal, ProcessSpec, ResourceUsage, Result, WindowSize};
use std::ffi::OsStr;
use std::fs::File;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use winapi::shared::minwindef::{DWORD, FALSE, FILETIME, TRUE};
use winapi::um::handleapi::SetHandleInformation;
use winapi::um::jobapi2::{AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject};
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::namedpipeapi::CreatePipe;
use winapi::um::processthreadsapi::{
    CreateProcessW, GetExitCodeProcess, GetProcessTimes, ResumeThread, TerminateProcess,
    PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    CREATE_BREAKAWAY_FROM_JOB, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, HANDLE_FLAG_INHERIT,
    INFINITE, STARTF_USESTDHANDLES, WAIT_FAILED, WAIT_OBJECT_0,
};
use winapi::um::winnt::HANDLE;

/// Exit code given to every process in a terminated job
const TERMINATED_EXIT_CODE: u32 = 1;

/// WaitForSingleObject can return before the process is fully torn down
const REAP_SETTLE_DELAY: Duration = Duration::from_millis(5);

/// Job-object primitives, resolved once and shared by every spawned process
#[derive(Debug, Default)]
pub(crate) struct JobControl {
    /// Held while inheritable pipe ends exist, so a concurrent spawn cannot
    /// leak them into an unrelated child
    spawn_lock: Mutex<()>,
}

impl JobControl {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self::default())
    }

    fn create_job(&self) -> Result<OwnedHandle> {
        // SAFETY: null attributes and name create an anonymous job
        let job = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
        if job.is_null() {
            return Err(HoudiniError::last_os_error("CreateJobObjectW"));
        }
        // SAFETY: `job` is a fresh handle we own
        Ok(unsafe { OwnedHandle::from_raw_handle(job as _) })
    }

    fn assign(&self, job: &OwnedHandle, process: &OwnedHandle) -> Result<()> {
        // SAFETY: both handles are open for the duration of the call
        let ok = unsafe { AssignProcessToJobObject(raw(job), raw(process)) };
        if ok == FALSE {
            return Err(HoudiniError::last_os_error("AssignProcessToJobObject"));
        }
        Ok(())
    }

    fn terminate(&self, job: &OwnedHandle, exit_code: u32) -> Result<()> {
        // SAFETY: the job handle is open
        let ok = unsafe { TerminateJobObject(raw(job), exit_code) };
        if ok == FALSE {
            return Err(HoudiniError::last_os_error("TerminateJobObject"));
        }
        Ok(())
    }
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}

/// A child confined to its own job object
pub struct JobProcess {
    pid: u32,
    job: OwnedHandle,
    process: OwnedHandle,
    control: Arc<JobControl>,
}

impl ProcessControl for JobProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    /// Jobs have no graceful signals; every request terminates the whole job
    fn signal(&self, _signal: ProcessSignal) -> Result<()> {
        self.control.terminate(&self.job, TERMINATED_EXIT_CODE)
    }

    fn reap(&self) -> Result<ExitStatus> {
        // SAFETY: the process handle is open
        match unsafe { WaitForSingleObject(raw(&self.process), INFINITE) } {
            WAIT_OBJECT_0 => {}
            WAIT_FAILED => return Err(HoudiniError::last_os_error("WaitForSingleObject")),
            other => {
                return Err(HoudiniError::Internal(format!(
                    "unexpected result {:#x} from WaitForSingleObject",
                    other
                )))
            }
        }

        let mut code: DWORD = 0;
        // SAFETY: the out-pointer references a live local
        if unsafe { GetExitCodeProcess(raw(&self.process), &mut code) } == FALSE {
            return Err(HoudiniError::last_os_error("GetExitCodeProcess"));
        }

        let mut creation = zero_filetime();
        let mut exit = zero_filetime();
        let mut kernel = zero_filetime();
        let mut user = zero_filetime();
        // SAFETY: all out-pointers reference live locals
        let ok = unsafe {
            GetProcessTimes(
                raw(&self.process),
                &mut creation,
                &mut exit,
                &mut kernel,
                &mut user,
            )
        };
        if ok == FALSE {
            return Err(HoudiniError::last_os_error("GetProcessTimes"));
        }

        thread::sleep(REAP_SETTLE_DELAY);

        Ok(ExitStatus {
            code: code as i32,
            signal: None,
            usage: Some(ResourceUsage {
                user_time: filetime_to_duration(&user),
                system_time: filetime_to_duration(&kernel),
                max_rss: None,
                wall_time: Some(
                    filetime_to_duration(&exit).saturating_sub(filetime_to_duration(&creation)),
                ),
            }),
        })
    }

    /// Pseudo-terminals are not supported here
    fn set_window_size(&self, _size: WindowSize) -> Result<()> {
        Ok(())
    }
}

fn zero_filetime() -> FILETIME {
    FILETIME {
        dwLowDateTime: 0,
        dwHighDateTime: 0,
    }
}

/// FILETIME counts 100ns intervals
fn filetime_to_duration(ft: &FILETIME) -> Duration {
    let ticks = ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64;
    Duration::from_nanos(ticks.saturating_mul(100))
}

enum ChildEnd {
    Read,
    Write,
}

/// Anonymous pipe whose child-side end alone is inheritable.
///
/// Returns `(child_end, parent_end)`.
fn anon_pipe(child_end: ChildEnd) -> Result<(OwnedHandle, OwnedHandle)> {
    let mut attrs = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    // SAFETY: out-pointers reference live locals
    if unsafe { CreatePipe(&mut read, &mut write, &mut attrs, 0) } == FALSE {
        return Err(HoudiniError::last_os_error("CreatePipe"));
    }
    // SAFETY: CreatePipe returned two fresh handles we own
    let (read, write) = unsafe {
        (
            OwnedHandle::from_raw_handle(read as _),
            OwnedHandle::from_raw_handle(write as _),
        )
    };

    let (child, parent) = match child_end {
        ChildEnd::Read => (read, write),
        ChildEnd::Write => (write, read),
    };
    // SAFETY: the parent end is open
    if unsafe { SetHandleInformation(raw(&parent), HANDLE_FLAG_INHERIT, 0) } == FALSE {
        return Err(HoudiniError::last_os_error("SetHandleInformation"));
    }
    Ok((child, parent))
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(Some(0)).collect()
}

/// Quote one argument so the MSVC runtime parses it back unchanged
fn quote_arg(arg: &str, cmdline: &mut String) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\u{b}', '"']);
    if !needs_quotes {
        cmdline.push_str(arg);
        return;
    }

    cmdline.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                cmdline.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                cmdline.push('"');
                backslashes = 0;
            }
            _ => {
                cmdline.extend(std::iter::repeat('\\').take(backslashes));
                cmdline.push(c);
                backslashes = 0;
            }
        }
    }
    cmdline.extend(std::iter::repeat('\\').take(backslashes * 2));
    cmdline.push('"');
}

fn command_line(spec: &ProcessSpec) -> String {
    let mut cmdline = String::new();
    for (i, arg) in std::iter::once(&spec.path).chain(&spec.args).enumerate() {
        if i > 0 {
            cmdline.push(' ');
        }
        quote_arg(arg, &mut cmdline);
    }
    cmdline
}

/// UTF-16 environment block: `K=V\0K=V\0\0`
fn env_block(env: &[String]) -> Vec<u16> {
    let mut block: Vec<u16> = Vec::new();
    for entry in env {
        block.extend(OsStr::new(entry).encode_wide());
        block.push(0);
    }
    if env.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Create the child suspended, confine it to a new job, then let it run
pub(crate) fn spawn(control: &Arc<JobControl>, spec: &ProcessSpec, executable: &Path) -> Result<Spawned> {
    let application = wide(executable.as_os_str());
    let mut cmdline = wide(OsStr::new(&command_line(spec)));
    let mut env = spec.env.as_deref().map(env_block);
    let dir = spec.dir.as_ref().map(|d| wide(d.as_os_str()));

    let guard = control
        .spawn_lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let (stdout_child, stdout_parent) = anon_pipe(ChildEnd::Write)?;
    let (stderr_child, stderr_parent) = anon_pipe(ChildEnd::Write)?;
    let (stdin_child, stdin_parent) = anon_pipe(ChildEnd::Read)?;

    // SAFETY: STARTUPINFOW is plain old data; all-zero is valid
    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as DWORD;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = raw(&stdin_child);
    startup.hStdOutput = raw(&stdout_child);
    startup.hStdError = raw(&stderr_child);

    // SAFETY: PROCESS_INFORMATION is plain old data; all-zero is valid
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let flags = CREATE_UNICODE_ENVIRONMENT | CREATE_SUSPENDED | CREATE_BREAKAWAY_FROM_JOB;

    // SAFETY: every pointer references a live, NUL-terminated buffer or is null
    let ok = unsafe {
        CreateProcessW(
            application.as_ptr(),
            cmdline.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            TRUE,
            flags,
            env.as_mut()
                .map_or(ptr::null_mut(), |block| block.as_mut_ptr() as *mut _),
            dir.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
            &mut startup,
            &mut info,
        )
    };
    if ok == FALSE {
        return Err(HoudiniError::Spawn {
            path: spec.path.clone(),
            source: std::io::Error::last_os_error(),
        });
    }

    // SAFETY: CreateProcessW returned two fresh handles we own
    let (process, thread) = unsafe {
        (
            OwnedHandle::from_raw_handle(info.hProcess as _),
            OwnedHandle::from_raw_handle(info.hThread as _),
        )
    };

    // Release our copies of the child-side ends so EOF reaches the relays
    drop(stdin_child);
    drop(stdout_child);
    drop(stderr_child);
    drop(guard);

    let abandon = |e: HoudiniError| {
        // SAFETY: the process handle is open
        unsafe { TerminateProcess(raw(&process), TERMINATED_EXIT_CODE) };
        e
    };

    let job = control.create_job().map_err(abandon)?;
    control.assign(&job, &process).map_err(abandon)?;
    // SAFETY: the thread handle is open
    if unsafe { ResumeThread(raw(&thread)) } == DWORD::MAX {
        return Err(abandon(HoudiniError::last_os_error("ResumeThread")));
    }

    log::debug!("Started {} as pid {} in its own job", spec.path, info.dwProcessId);

    Ok(Spawned {
        child: JobProcess {
            pid: info.dwProcessId,
            job,
            process,
            control: Arc::clone(control),
        },
        stdin: File::from(stdin_parent),
        stdout: File::from(stdout_parent),
        stderr: Some(File::from(stderr_parent)),
        eof: None,
    })
}
